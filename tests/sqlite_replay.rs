use tempfile::TempDir;

use recipientdb::{
    conversation::{MessageBody, MessageDraft},
    core::{
        refs::{RefDraft, RefKind},
        store::RecipientStore,
    },
    op::{Op, StoredOp},
    oracle::{LocalIdentity, NoSessions},
    persist::{OpSink, sqlite::SqliteOpSink},
    recipient::ResolveRequest,
    types::{Aci, Pni},
};

const E_A: &str = "+15551110001";
const E_B: &str = "+15551110002";
const ACI_A: Aci = Aci::from_u128(0xACE);
const PNI_A: Pni = Pni::from_u128(0xBEE);

fn build_history(store: &mut RecipientStore) {
    let local = LocalIdentity::default();
    let by_aci = store
        .resolve(&ResolveRequest::new(Some(E_B), None, Some(ACI_A)), &NoSessions, &local)
        .expect("resolve aci");
    let by_number = store
        .resolve(&ResolveRequest::new(Some(E_A), Some(PNI_A), None), &NoSessions, &local)
        .expect("resolve number");

    let (aci_thread, _) = store.create_thread(by_aci).expect("thread");
    let (number_thread, _) = store.create_thread(by_number).expect("thread");
    for (thread_id, author, sent_ms) in [(aci_thread, by_aci, 5), (number_thread, by_number, 7)] {
        store
            .insert_message(MessageDraft {
                thread_id,
                author,
                sent_ms,
                body: MessageBody::Text(format!("from {author}")),
            })
            .expect("message");
    }
    store
        .add_reference(RefDraft {
            kind: RefKind::DistributionMembership,
            owner: by_number,
            subject: None,
            key: "list-1".to_string(),
        })
        .expect("reference");
    store.set_blocked(by_number, true).expect("block");

    store
        .resolve(&ResolveRequest::new(Some(E_A), Some(PNI_A), Some(ACI_A)), &NoSessions, &local)
        .expect("merge");
}

#[test]
fn replay_rebuilds_identical_state_without_replanning() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("recipients.db");

    let mut store = RecipientStore::new();
    let mut sink = SqliteOpSink::open(&db_path).expect("open sqlite");

    build_history(&mut store);
    let ops = store.drain_pending_ops();
    assert!(ops.iter().any(|stored| matches!(stored.op, Op::Resolve { .. })));
    let last = sink.append_ops(&ops).expect("append");
    assert_eq!(last, store.latest_op_seq());
    drop(sink);

    let reopened = SqliteOpSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_store().expect("replay");

    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert_eq!(replayed.remapped(2), Some(1));
    assert!(replayed.get(1).is_some_and(|r| r.blocked));
}

#[test]
fn events_are_indexed_by_recipient() {
    let mut store = RecipientStore::new();
    let mut sink = SqliteOpSink::open_in_memory().expect("open sqlite");

    build_history(&mut store);
    sink.append_ops(&store.drain_pending_ops()).expect("append");

    let merged_into = |stored: &StoredOp| match &stored.op {
        Op::Resolve { change_set, .. } => change_set.merged_away() == vec![2],
        _ => false,
    };

    let for_number = sink.events_for_recipient(2).expect("query");
    assert!(for_number.iter().any(|s| matches!(s.op, Op::SetBlocked { id: 2, blocked: true })));
    assert!(for_number.iter().all(|s| s.op.recipients().contains(&2)));
    assert_eq!(for_number.last().map(merged_into), Some(true));

    let for_survivor = sink.events_for_recipient(1).expect("query");
    assert!(for_survivor.iter().any(merged_into));
    assert!(for_survivor.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn newer_journal_schema_is_refused() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("future.db");
    {
        let conn = rusqlite::Connection::open(&db_path).expect("open raw");
        conn.pragma_update(None, "user_version", 99).expect("bump version");
    }
    assert!(SqliteOpSink::open(&db_path).is_err());
}

#[test]
fn snapshot_and_compaction_preserve_replay() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("snap.db");

    let mut store = RecipientStore::new();
    let mut sink = SqliteOpSink::open(&db_path).expect("open sqlite");

    build_history(&mut store);
    sink.append_ops(&store.drain_pending_ops()).expect("append");

    let snapshot = store.export_snapshot();
    let last_seq = store.latest_op_seq();
    sink.write_snapshot(&snapshot, last_seq).expect("snapshot");
    let removed = sink.compact_through(last_seq).expect("compact");
    assert!(removed > 0);
    assert_eq!(sink.latest_seq().expect("latest"), 0);

    let local = LocalIdentity::default();
    let fresh = store
        .resolve(&ResolveRequest::new(Some("+15551110003"), None, None), &NoSessions, &local)
        .expect("resolve after snapshot");
    sink.append_ops(&store.drain_pending_ops()).expect("append tail");
    drop(sink);

    let reopened = SqliteOpSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_store().expect("replay");

    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert_eq!(replayed.by_e164("+15551110003").map(|r| r.id), Some(fresh));
}
