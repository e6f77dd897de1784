use crate::{
    recipient::{RecipientRecord, ResolveRequest},
    types::{Aci, Pni, RecipientId, ServiceId},
};

/// Exact-match lookups the matcher runs.
pub trait IdentityIndex {
    /// Record currently holding `e164`.
    fn id_by_e164(&self, e164: &str) -> Option<RecipientId>;
    /// Record holding `pni` in its PNI column.
    fn id_by_pni_column(&self, pni: Pni) -> Option<RecipientId>;
    /// Record using `service_id` for addressing.
    fn id_by_service_id(&self, service_id: ServiceId) -> Option<RecipientId>;
    /// Loads a record.
    fn record(&self, id: RecipientId) -> Option<&RecipientRecord>;
}

/// Records found for each identifier of a tuple. Entries may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches {
    /// Holder of the e164.
    pub by_e164: Option<RecipientRecord>,
    /// Record addressed by the PNI (PNI-only records).
    pub by_pni_as_service_id: Option<RecipientRecord>,
    /// Holder of the PNI column.
    pub by_pni_column: Option<RecipientRecord>,
    /// Holder of the ACI.
    pub by_aci: Option<RecipientRecord>,
}

impl Matches {
    /// The record matched by the PNI, preferring the PNI column.
    pub fn by_pni(&self) -> Option<&RecipientRecord> {
        self.by_pni_column
            .as_ref()
            .or(self.by_pni_as_service_id.as_ref())
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.by_e164.is_none() && self.by_pni().is_none() && self.by_aci.is_none()
    }
}

/// Probes `index` once per identifier present in `request`.
pub fn find_matches(index: &impl IdentityIndex, request: &ResolveRequest) -> Matches {
    let load = |id: Option<RecipientId>| id.and_then(|id| index.record(id)).cloned();

    Matches {
        by_e164: load(request.e164.as_deref().and_then(|e| index.id_by_e164(e))),
        by_pni_as_service_id: load(
            request
                .pni
                .and_then(|p| index.id_by_service_id(ServiceId::Pni(p))),
        ),
        by_pni_column: load(request.pni.and_then(|p| index.id_by_pni_column(p))),
        by_aci: load(
            request
                .aci
                .and_then(|a: Aci| index.id_by_service_id(ServiceId::Aci(a))),
        ),
    }
}
