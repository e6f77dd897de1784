//! Tuple resolution planner.
//!
//! Pure function from an observed `(e164?, pni?, aci?)` tuple and the records
//! it matched to a [`ChangeSet`]. Nothing here touches storage.
//!
//! Planning runs in two phases. Phase A reconciles the e164 and pni matches
//! into an intermediate anchor. Phase B reconciles that anchor with the ACI:
//! a record that already owns the ACI always ends up as the survivor.
//!
//! Operations are simulated against a working copy of the matched records as
//! they are emitted, so every later decision sees the effect of earlier ones.

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    changeset::{ChangeSet, ChangeSetTarget, PnpOperation},
    oracle::{LocalIdentityOracle, OracleError, SessionOracle},
    recipient::{IdentityFields, RecipientRecord, ResolveRequest},
    types::{Aci, Pni, RecipientId, ServiceId},
};

use super::{error::ResolveError, matcher::Matches};

/// Collaborators consulted while planning.
pub struct PlanContext<'a> {
    /// Session existence lookups.
    pub sessions: &'a dyn SessionOracle,
    /// Local user's identifiers.
    pub local: &'a dyn LocalIdentityOracle,
}

/// Builds the change-set for `request` given what the matcher found.
pub fn plan(
    request: &ResolveRequest,
    matches: &Matches,
    ctx: &PlanContext<'_>,
) -> Result<ChangeSet, ResolveError> {
    let wanted = request.fields();
    if wanted.is_empty() {
        return Err(ResolveError::InvalidTuple);
    }

    if matches.is_empty() {
        debug!("nothing matches, inserting");
        return Ok(ChangeSet::insert(wanted));
    }

    let mut work = Working {
        slots: HashMap::new(),
        ops: Vec::new(),
        merged: Vec::new(),
        pni_moves: Vec::new(),
        change_self: request.change_self,
        local_e164: ctx.local.local_e164()?,
        local_aci: ctx.local.local_aci()?,
    };
    for rec in [matches.by_e164.as_ref(), matches.by_pni(), matches.by_aci.as_ref()]
        .into_iter()
        .flatten()
    {
        work.track(rec);
    }

    let phase_a = reconcile_e164_pni(&mut work, request, matches);
    let survivor = reconcile_aci(&mut work, request, matches, &phase_a);

    let Some(id) = survivor else {
        let fields = IdentityFields {
            e164: if phase_a.e164_withheld { None } else { wanted.e164 },
            pni: wanted.pni,
            aci: wanted.aci,
        };
        debug!(steals = work.ops.len(), "no surviving match, inserting");
        return Ok(ChangeSet {
            target: ChangeSetTarget::Insert(fields),
            operations: work.ops,
        });
    };

    work.push_notices(id, request, ctx.sessions)?;
    Ok(ChangeSet {
        target: ChangeSetTarget::Existing(id),
        operations: work.ops,
    })
}

struct PhaseA {
    anchor: Option<RecipientId>,
    /// The requested e164 stays on the local record and must not be applied elsewhere.
    e164_withheld: bool,
}

fn reconcile_e164_pni(work: &mut Working, request: &ResolveRequest, matches: &Matches) -> PhaseA {
    // A record bound to a different ACI can only lose identifiers, never anchor.
    let conflicting = |rec: &RecipientRecord| {
        request.aci.is_some() && rec.aci().is_some_and(|aci| Some(aci) != request.aci)
    };

    let mut e164_withheld = false;
    let mut e164_target = None;
    if let Some(rec) = &matches.by_e164 {
        if conflicting(rec) {
            debug!(id = rec.id, "e164 held by a record with another aci, stealing");
            e164_withheld = !work.remove_e164(rec.id);
        } else {
            e164_target = Some(rec.id);
        }
    }

    let mut pni_target = None;
    if let Some(rec) = matches.by_pni() {
        if conflicting(rec) {
            debug!(id = rec.id, "pni held by a record with another aci, stealing");
            work.remove_pni(rec.id);
        } else {
            pni_target = Some(rec.id);
        }
    }

    let anchor = match (e164_target, pni_target) {
        (None, None) => None,
        (Some(by_e164), None) => {
            if let Some(pni) = request.pni {
                work.set_pni(by_e164, pni);
            }
            Some(by_e164)
        }
        (None, Some(by_pni)) => {
            if let Some(e164) = request.e164.as_deref()
                && !e164_withheld
            {
                work.set_e164(by_pni, e164);
            }
            Some(by_pni)
        }
        (Some(by_e164), Some(by_pni)) if by_e164 == by_pni => Some(by_e164),
        (Some(by_e164), Some(by_pni)) => {
            if work.fields(by_pni).is_some_and(IdentityFields::pni_only) {
                debug!(primary = by_e164, secondary = by_pni, "pni-only record merges into e164 record");
                work.merge(by_e164, by_pni);
            } else if let Some(pni) = request.pni {
                debug!(from = by_pni, to = by_e164, "stealing pni");
                work.remove_pni(by_pni);
                work.set_pni(by_e164, pni);
                work.pni_moves.push(PniMove {
                    donor: by_pni,
                    receiver: by_e164,
                    pni,
                });
            }
            Some(by_e164)
        }
    };

    PhaseA {
        anchor,
        e164_withheld,
    }
}

fn reconcile_aci(
    work: &mut Working,
    request: &ResolveRequest,
    matches: &Matches,
    phase_a: &PhaseA,
) -> Option<RecipientId> {
    let Some(aci) = request.aci else {
        return phase_a.anchor;
    };

    let Some(owner) = matches.by_aci.as_ref().map(|rec| rec.id) else {
        if let Some(anchor) = phase_a.anchor {
            work.set_aci(anchor, aci);
        }
        return phase_a.anchor;
    };

    match phase_a.anchor {
        Some(anchor) if anchor == owner => Some(owner),
        Some(anchor) => {
            debug!(primary = owner, secondary = anchor, "aci owner absorbs anchor");
            work.merge(owner, anchor);
            Some(owner)
        }
        None => {
            if let Some(e164) = request.e164.as_deref()
                && !phase_a.e164_withheld
            {
                work.set_e164(owner, e164);
            }
            if let Some(pni) = request.pni {
                work.set_pni(owner, pni);
            }
            Some(owner)
        }
    }
}

struct Slot {
    before: RecipientRecord,
    now: IdentityFields,
}

/// A PNI taken from one record and given to another within the same plan.
struct PniMove {
    donor: RecipientId,
    receiver: RecipientId,
    pni: Pni,
}

struct Working {
    slots: HashMap<RecipientId, Slot>,
    ops: Vec<PnpOperation>,
    /// Secondaries of every planned merge.
    merged: Vec<RecipientId>,
    pni_moves: Vec<PniMove>,
    change_self: bool,
    local_e164: Option<String>,
    local_aci: Option<Aci>,
}

impl Working {
    fn track(&mut self, rec: &RecipientRecord) {
        self.slots.entry(rec.id).or_insert_with(|| Slot {
            before: rec.clone(),
            now: rec.fields(),
        });
    }

    fn fields(&self, id: RecipientId) -> Option<&IdentityFields> {
        self.slots.get(&id).map(|slot| &slot.now)
    }

    fn is_local(&self, id: RecipientId) -> bool {
        let Some(slot) = self.slots.get(&id) else {
            return false;
        };
        (self.local_aci.is_some() && slot.before.aci() == self.local_aci)
            || (self.local_e164.is_some() && slot.before.e164 == self.local_e164)
    }

    /// True when the tuple carries one of the local user's own identifiers.
    fn names_local(&self, request: &ResolveRequest) -> bool {
        (request.e164.is_some() && request.e164 == self.local_e164)
            || (request.aci.is_some() && request.aci == self.local_aci)
    }

    fn e164_locked(&self, id: RecipientId) -> bool {
        !self.change_self && self.is_local(id)
    }

    /// Returns false when the local-identity guard kept the e164 in place.
    fn remove_e164(&mut self, id: RecipientId) -> bool {
        let locked = self.e164_locked(id);
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if slot.now.e164.is_none() {
            return true;
        }
        if locked {
            debug!(id, "local e164 kept, change_self not set");
            return false;
        }
        slot.now.e164 = None;
        self.ops.push(PnpOperation::RemoveE164 { id });
        true
    }

    fn set_e164(&mut self, id: RecipientId, e164: &str) {
        let locked = self.e164_locked(id);
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.now.e164.as_deref() == Some(e164) {
            return;
        }
        if slot.now.e164.is_some() && locked {
            debug!(id, "local e164 kept, change_self not set");
            return;
        }
        slot.now.e164 = Some(e164.to_string());
        self.ops.push(PnpOperation::SetE164 {
            id,
            e164: e164.to_string(),
        });
    }

    fn remove_pni(&mut self, id: RecipientId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.now.pni.take().is_some() {
            self.ops.push(PnpOperation::RemovePni { id });
        }
    }

    fn set_pni(&mut self, id: RecipientId, pni: Pni) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.now.pni != Some(pni) {
            slot.now.pni = Some(pni);
            self.ops.push(PnpOperation::SetPni { id, pni });
        }
    }

    fn set_aci(&mut self, id: RecipientId, aci: Aci) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.now.aci.is_none() {
            slot.now.aci = Some(aci);
            self.ops.push(PnpOperation::SetAci { id, aci });
        }
    }

    fn merge(&mut self, primary: RecipientId, secondary: RecipientId) {
        let (Some(p), Some(s)) = (self.fields(primary).cloned(), self.fields(secondary).cloned()) else {
            return;
        };

        // The secondary carries the freshest e164/pni; clear the primary's so the merge copies them.
        if let (Some(pe), Some(se)) = (&p.e164, &s.e164)
            && pe != se
        {
            self.remove_e164(primary);
        }
        if let (Some(pp), Some(sp)) = (p.pni, s.pni)
            && pp != sp
        {
            self.remove_pni(primary);
        }

        self.ops.push(PnpOperation::Merge { primary, secondary });
        self.merged.push(secondary);

        if let Some(slot) = self.slots.get_mut(&secondary) {
            slot.now = IdentityFields::default();
        }
        if let Some(slot) = self.slots.get_mut(&primary) {
            if slot.now.e164.is_none() {
                slot.now.e164 = s.e164;
            }
            if slot.now.pni.is_none() {
                slot.now.pni = s.pni;
            }
            if slot.now.aci.is_none() {
                slot.now.aci = s.aci;
            }
        }
    }

    fn push_notices(
        &mut self,
        id: RecipientId,
        request: &ResolveRequest,
        sessions: &dyn SessionOracle,
    ) -> Result<(), OracleError> {
        let Some(slot) = self.slots.get(&id) else {
            return Ok(());
        };
        let before = slot.before.fields();
        let now = slot.now.clone();
        let blocked = slot.before.blocked;

        if let (Some(old_e164), Some(new_e164)) = (&before.e164, &now.e164)
            && old_e164 != new_e164
            && before.aci.is_some()
            && !blocked
            && !self.is_local(id)
            && !self.names_local(request)
        {
            debug!(id, "number changed");
            self.ops.push(PnpOperation::ChangeNumberNotice {
                id,
                old_e164: old_e164.clone(),
                new_e164: new_e164.clone(),
            });
        }

        if request.pni_verified {
            return Ok(());
        }

        let mut switched = Vec::new();
        for PniMove { donor, receiver, pni } in std::mem::take(&mut self.pni_moves) {
            if !sessions.has_session(ServiceId::Pni(pni))? {
                continue;
            }
            // Donor and receiver of an unverified move are both notified.
            for target in [donor, receiver] {
                let Some(target_slot) = self.slots.get(&target) else {
                    continue;
                };
                if target_slot.before.aci().is_some() || switched.contains(&target) {
                    continue;
                }
                if target == receiver && target != id {
                    continue;
                }
                debug!(id = target, "pni moved under an existing session");
                self.ops.push(PnpOperation::SessionSwitchoverNotice {
                    id: target,
                    e164: target_slot.now.e164.clone(),
                });
                switched.push(target);
            }
        }

        if !switched.contains(&id) && self.address_switched(id, &before, &now, sessions)? {
            debug!(id, "addressing changed under an existing session");
            self.ops.push(PnpOperation::SessionSwitchoverNotice { id, e164: now.e164 });
        }

        Ok(())
    }

    /// Whether a session keyed by a PNI the survivor was reachable under no longer addresses it.
    ///
    /// That is the case when the survivor's PNI changed, or when a PNI-addressed record
    /// (the survivor itself or one merged into it) is now addressed by an ACI.
    fn address_switched(
        &self,
        id: RecipientId,
        before: &IdentityFields,
        now: &IdentityFields,
        sessions: &dyn SessionOracle,
    ) -> Result<bool, OracleError> {
        if let Some(old_pni) = before.pni
            && now.pni != Some(old_pni)
            && sessions.has_session(ServiceId::Pni(old_pni))?
        {
            return Ok(true);
        }

        if now.aci.is_none() {
            return Ok(false);
        }
        let folded = self
            .slots
            .iter()
            .filter(|(slot_id, _)| **slot_id == id || self.merged.contains(*slot_id))
            .filter_map(|(_, slot)| slot.before.service_id.and_then(ServiceId::pni))
            .filter(|pni| now.pni == Some(*pni));
        for pni in folded {
            if sessions.has_session(ServiceId::Pni(pni))? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;

    use super::*;
    use crate::oracle::{LocalIdentity, NoSessions};

    const E164_A: &str = "+12221234567";
    const E164_B: &str = "+13331234567";
    const E164_SELF: &str = "+15550000000";
    const PNI_A: Pni = Pni::from_u128(0xa1);
    const PNI_B: Pni = Pni::from_u128(0xb1);
    const ACI_A: Aci = Aci::from_u128(0xa2);
    const ACI_B: Aci = Aci::from_u128(0xb2);

    fn rec(id: RecipientId, e164: Option<&str>, pni: Option<Pni>, aci: Option<Aci>) -> RecipientRecord {
        RecipientRecord::new(
            id,
            &IdentityFields {
                e164: e164.map(str::to_string),
                pni,
                aci,
            },
            false,
        )
    }

    /// Mirrors what the matcher would return over `records`.
    fn matches_over(records: &[RecipientRecord], req: &ResolveRequest) -> Matches {
        let find = |pred: &dyn Fn(&RecipientRecord) -> bool| records.iter().find(|r| pred(r)).cloned();
        Matches {
            by_e164: req
                .e164
                .as_ref()
                .and_then(|e| find(&|r| r.e164.as_ref() == Some(e))),
            by_pni_as_service_id: req
                .pni
                .and_then(|p| find(&|r| r.service_id == Some(ServiceId::Pni(p)))),
            by_pni_column: req.pni.and_then(|p| find(&|r| r.pni == Some(p))),
            by_aci: req.aci.and_then(|a| find(&|r| r.aci() == Some(a))),
        }
    }

    fn plan_over(records: &[RecipientRecord], req: &ResolveRequest) -> ChangeSet {
        plan_with(records, req, &NoSessions, &LocalIdentity::default())
    }

    fn plan_with(
        records: &[RecipientRecord],
        req: &ResolveRequest,
        sessions: &dyn SessionOracle,
        local: &LocalIdentity,
    ) -> ChangeSet {
        let ctx = PlanContext { sessions, local };
        plan(req, &matches_over(records, req), &ctx).expect("plan")
    }

    #[test]
    fn empty_tuple_is_rejected() {
        let ctx = PlanContext {
            sessions: &NoSessions,
            local: &LocalIdentity::default(),
        };
        let err = plan(&ResolveRequest::default(), &Matches::default(), &ctx).unwrap_err();
        assert_eq!(err, ResolveError::InvalidTuple);
    }

    #[test]
    fn no_match_inserts() {
        let req = ResolveRequest::new(Some(E164_A), None, Some(ACI_A));
        let cs = plan_over(&[], &req);
        assert_eq!(cs.target, ChangeSetTarget::Insert(req.fields()));
        assert!(cs.operations.is_empty());
    }

    #[test]
    fn full_match_is_noop() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), Some(ACI_A))];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)));
        assert!(cs.is_noop());
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
    }

    #[test]
    fn e164_only_record_gains_pni_and_aci() {
        let records = [rec(1, Some(E164_A), None, None)];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)));
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::SetPni { id: 1, pni: PNI_A },
                PnpOperation::SetAci { id: 1, aci: ACI_A },
            ]
        );
    }

    #[test]
    fn aci_record_absorbs_e164_pni_record() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), None), rec(2, None, None, Some(ACI_A))];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)));
        assert_eq!(cs.target, ChangeSetTarget::Existing(2));
        assert_eq!(cs.operations, vec![PnpOperation::Merge { primary: 2, secondary: 1 }]);
    }

    #[test]
    fn number_change_on_known_aci_emits_notice() {
        let records = [rec(1, Some(E164_B), Some(PNI_A), Some(ACI_A))];
        let sessions: HashSet<ServiceId> = [ServiceId::Pni(PNI_A)].into_iter().collect();
        let cs = plan_with(
            &records,
            &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)),
            &sessions,
            &LocalIdentity::default(),
        );
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::SetE164 { id: 1, e164: E164_A.to_string() },
                PnpOperation::ChangeNumberNotice {
                    id: 1,
                    old_e164: E164_B.to_string(),
                    new_e164: E164_A.to_string(),
                },
            ]
        );
    }

    #[test]
    fn pni_is_stolen_without_merging() {
        let records = [rec(1, Some(E164_A), Some(PNI_B), None), rec(2, Some(E164_B), Some(PNI_A), None)];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), None));
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::RemovePni { id: 2 },
                PnpOperation::SetPni { id: 1, pni: PNI_A },
            ]
        );
    }

    #[test]
    fn pni_only_record_merges_into_e164_record() {
        let records = [rec(1, Some(E164_A), None, None), rec(2, None, Some(PNI_A), None)];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), None));
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
        assert_eq!(cs.operations, vec![PnpOperation::Merge { primary: 1, secondary: 2 }]);
    }

    #[test]
    fn three_records_cascade_into_aci_owner() {
        let records = [
            rec(1, Some(E164_A), None, None),
            rec(2, None, Some(PNI_A), None),
            rec(3, None, None, Some(ACI_A)),
        ];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)));
        assert_eq!(cs.target, ChangeSetTarget::Existing(3));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::Merge { primary: 1, secondary: 2 },
                PnpOperation::Merge { primary: 3, secondary: 1 },
            ]
        );
    }

    #[test]
    fn merge_into_aci_owner_replaces_its_number() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), None), rec(2, Some(E164_B), None, Some(ACI_A))];
        let cs = plan_over(&records, &ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A)));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::RemoveE164 { id: 2 },
                PnpOperation::Merge { primary: 2, secondary: 1 },
                PnpOperation::ChangeNumberNotice {
                    id: 2,
                    old_e164: E164_B.to_string(),
                    new_e164: E164_A.to_string(),
                },
            ]
        );
    }

    #[test]
    fn pni_change_with_session_emits_switchover() {
        let records = [rec(1, Some(E164_A), Some(PNI_B), None)];
        let sessions: HashSet<ServiceId> = [ServiceId::Pni(PNI_B)].into_iter().collect();
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), None);

        let cs = plan_with(&records, &req, &sessions, &LocalIdentity::default());
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::SetPni { id: 1, pni: PNI_A },
                PnpOperation::SessionSwitchoverNotice {
                    id: 1,
                    e164: Some(E164_A.to_string()),
                },
            ]
        );

        let verified = plan_with(&records, &req.clone().with_pni_verified(true), &sessions, &LocalIdentity::default());
        assert_eq!(verified.operations, vec![PnpOperation::SetPni { id: 1, pni: PNI_A }]);
    }

    #[test]
    fn different_aci_steals_identifiers_into_new_record() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), Some(ACI_B))];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A));
        let cs = plan_over(&records, &req);
        assert_eq!(cs.target, ChangeSetTarget::Insert(req.fields()));
        assert_eq!(
            cs.operations,
            vec![PnpOperation::RemoveE164 { id: 1 }, PnpOperation::RemovePni { id: 1 }]
        );
    }

    #[test]
    fn local_e164_is_not_overwritten_without_change_self() {
        let local = LocalIdentity {
            e164: Some(E164_SELF.to_string()),
            aci: Some(ACI_A),
        };
        let records = [rec(1, Some(E164_SELF), None, Some(ACI_A))];
        let req = ResolveRequest::new(Some(E164_A), None, Some(ACI_A));

        let guarded = plan_with(&records, &req, &NoSessions, &local);
        assert!(guarded.is_noop());

        let allowed = plan_with(&records, &req.clone().with_change_self(true), &NoSessions, &local);
        assert_eq!(allowed.operations, vec![PnpOperation::SetE164 { id: 1, e164: E164_A.to_string() }]);
    }

    #[test]
    fn blocked_recipient_gets_no_change_number_notice() {
        let mut blocked = rec(1, Some(E164_B), None, Some(ACI_A));
        blocked.blocked = true;
        let cs = plan_over(&[blocked], &ResolveRequest::new(Some(E164_A), None, Some(ACI_A)));
        assert_eq!(cs.operations, vec![PnpOperation::SetE164 { id: 1, e164: E164_A.to_string() }]);
    }

    fn sessions_on(pnis: &[Pni]) -> HashSet<ServiceId> {
        pnis.iter().map(|p| ServiceId::Pni(*p)).collect()
    }

    #[test]
    fn pni_addressed_record_gaining_aci_switches_over() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), None)];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A));
        let cs = plan_with(&records, &req, &sessions_on(&[PNI_A]), &LocalIdentity::default());
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::SetAci { id: 1, aci: ACI_A },
                PnpOperation::SessionSwitchoverNotice {
                    id: 1,
                    e164: Some(E164_A.to_string()),
                },
            ]
        );

        let quiet = plan_over(&records, &req);
        assert_eq!(quiet.operations, vec![PnpOperation::SetAci { id: 1, aci: ACI_A }]);
    }

    #[test]
    fn pni_only_record_gaining_number_and_aci_switches_over() {
        let records = [rec(1, None, Some(PNI_A), None)];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A));
        let cs = plan_with(&records, &req, &sessions_on(&[PNI_A]), &LocalIdentity::default());
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::SetE164 { id: 1, e164: E164_A.to_string() },
                PnpOperation::SetAci { id: 1, aci: ACI_A },
                PnpOperation::SessionSwitchoverNotice {
                    id: 1,
                    e164: Some(E164_A.to_string()),
                },
            ]
        );
    }

    #[test]
    fn pni_only_record_folded_into_aci_owner_switches_over() {
        let records = [rec(1, None, None, Some(ACI_A)), rec(2, None, Some(PNI_A), None)];
        let req = ResolveRequest::new(None, Some(PNI_A), Some(ACI_A));
        let cs = plan_with(&records, &req, &sessions_on(&[PNI_A]), &LocalIdentity::default());
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::Merge { primary: 1, secondary: 2 },
                PnpOperation::SessionSwitchoverNotice { id: 1, e164: None },
            ]
        );
    }

    #[test]
    fn aci_record_pni_session_untouched_when_pni_kept() {
        let records = [rec(1, Some(E164_A), Some(PNI_A), Some(ACI_A))];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), Some(ACI_A));
        let cs = plan_with(&records, &req, &sessions_on(&[PNI_A]), &LocalIdentity::default());
        assert!(cs.is_noop());
    }

    #[test]
    fn stolen_pni_under_session_notifies_donor_and_receiver() {
        let records = [rec(1, Some(E164_A), Some(PNI_B), None), rec(2, Some(E164_B), Some(PNI_A), None)];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), None);
        let cs = plan_with(&records, &req, &sessions_on(&[PNI_A, PNI_B]), &LocalIdentity::default());
        assert_eq!(cs.target, ChangeSetTarget::Existing(1));
        assert_eq!(
            cs.operations,
            vec![
                PnpOperation::RemovePni { id: 2 },
                PnpOperation::SetPni { id: 1, pni: PNI_A },
                PnpOperation::SessionSwitchoverNotice {
                    id: 2,
                    e164: Some(E164_B.to_string()),
                },
                PnpOperation::SessionSwitchoverNotice {
                    id: 1,
                    e164: Some(E164_A.to_string()),
                },
            ]
        );

        let verified = plan_with(
            &records,
            &req.clone().with_pni_verified(true),
            &sessions_on(&[PNI_A, PNI_B]),
            &LocalIdentity::default(),
        );
        assert_eq!(
            verified.operations,
            vec![PnpOperation::RemovePni { id: 2 }, PnpOperation::SetPni { id: 1, pni: PNI_A }]
        );
    }

    #[test]
    fn number_change_on_local_record_is_silent() {
        let local = LocalIdentity {
            e164: Some(E164_SELF.to_string()),
            aci: Some(ACI_A),
        };
        let records = [rec(1, Some(E164_SELF), None, Some(ACI_A))];
        let req = ResolveRequest::new(Some(E164_A), None, Some(ACI_A)).with_change_self(true);
        let cs = plan_with(&records, &req, &NoSessions, &local);
        assert_eq!(cs.operations, vec![PnpOperation::SetE164 { id: 1, e164: E164_A.to_string() }]);
    }

    #[test]
    fn oracle_failure_aborts_planning() {
        struct Down;
        impl SessionOracle for Down {
            fn has_session(&self, _: ServiceId) -> Result<bool, OracleError> {
                Err(OracleError("session store closed".to_string()))
            }
        }

        let records = [rec(1, Some(E164_A), Some(PNI_B), None)];
        let req = ResolveRequest::new(Some(E164_A), Some(PNI_A), None);
        let ctx = PlanContext {
            sessions: &Down,
            local: &LocalIdentity::default(),
        };
        let err = plan(&req, &matches_over(&records, &req), &ctx).unwrap_err();
        assert!(matches!(err, ResolveError::Oracle(_)));
    }
}
