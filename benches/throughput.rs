use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use recipientdb::{
    core::store::RecipientStore,
    oracle::{LocalIdentity, NoSessions},
    recipient::ResolveRequest,
    types::{Aci, Pni},
};

fn e164(i: u64) -> String {
    format!("+1{:010}", 2_000_000_000 + i)
}

fn aci(i: u64) -> Aci {
    Aci::from_u128(0xA000_0000 + u128::from(i))
}

fn pni(i: u64) -> Pni {
    Pni::from_u128(0xB000_0000 + u128::from(i))
}

fn bench_inserts(c: &mut Criterion) {
    let local = LocalIdentity::default();
    c.bench_function("resolve_insert_20k", |b| {
        b.iter(|| {
            let mut store = RecipientStore::new();
            for i in 0..20_000u64 {
                let number = e164(i);
                store
                    .resolve(&ResolveRequest::new(Some(number.as_str()), Some(pni(i)), Some(aci(i))), &NoSessions, &local)
                    .expect("resolve");
            }
        });
    });
}

fn bench_merges(c: &mut Criterion) {
    let local = LocalIdentity::default();
    c.bench_function("resolve_merge_5k", |b| {
        b.iter(|| {
            let mut store = RecipientStore::new();
            for i in 0..5_000u64 {
                let number = e164(i);
                store
                    .resolve(&ResolveRequest::new(None, None, Some(aci(i))), &NoSessions, &local)
                    .expect("aci");
                store
                    .resolve(&ResolveRequest::new(Some(number.as_str()), Some(pni(i)), None), &NoSessions, &local)
                    .expect("number");
                store
                    .resolve(&ResolveRequest::new(Some(number.as_str()), Some(pni(i)), Some(aci(i))), &NoSessions, &local)
                    .expect("merge");
            }
        });
    });
}

fn bench_noop_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("noop_resolve");
    let local = LocalIdentity::default();

    for n in [1_000u64, 10_000, 50_000] {
        let mut store = RecipientStore::new();
        for i in 0..n {
            let number = e164(i);
            store
                .resolve(&ResolveRequest::new(Some(number.as_str()), Some(pni(i)), Some(aci(i))), &NoSessions, &local)
                .expect("seed");
        }
        let wanted = e164(n / 2);
        let request = ResolveRequest::new(Some(wanted.as_str()), Some(pni(n / 2)), Some(aci(n / 2)));

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| store.resolve(&request, &NoSessions, &local).expect("resolve"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_inserts, bench_merges, bench_noop_resolve);
criterion_main!(benches);
