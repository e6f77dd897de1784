use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::{
    changeset::{ChangeSet, ChangeSetTarget, PnpOperation},
    conversation::{MessageBody, MessageDraft, MessageRecord, ThreadRecord},
    op::{Op, StoredOp},
    oracle::{LocalIdentityOracle, OracleError, SessionOracle},
    recipient::{IdentityFields, RecipientRecord, ResolveRequest},
    types::{Aci, MessageId, OpSeq, Pni, RecipientId, RowId, ServiceId, ThreadId},
};

use super::{
    error::{ResolveError, StoreError},
    matcher::{self, IdentityIndex},
    planner::{self, PlanContext},
    refs::{MigrationReport, RefDraft, RefKind, RefRow, RefTables},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Serializable image of the whole store.
pub struct StoreSnapshotV1 {
    /// Next recipient id to allocate.
    pub next_recipient_id: RecipientId,
    /// Next thread id to allocate.
    pub next_thread_id: ThreadId,
    /// Next message id to allocate.
    pub next_message_id: MessageId,
    /// Next reference row id to allocate.
    pub next_row_id: RowId,
    /// Next op sequence.
    pub next_op_seq: OpSeq,
    /// Live ids in creation order.
    pub order: Vec<RecipientId>,
    /// Live records in creation order.
    pub records: Vec<RecipientRecord>,
    /// Threads by id.
    pub threads: Vec<ThreadRecord>,
    /// Messages by id.
    pub messages: Vec<MessageRecord>,
    /// Dependent rows by id.
    pub refs: Vec<RefRow>,
    /// Merged-away id to the id that absorbed it.
    pub remapped: Vec<(RecipientId, RecipientId)>,
}

/// What one resolution did, for callers that fan out notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Surviving recipient.
    pub id: RecipientId,
    /// True when the survivor was created by this resolution.
    pub inserted: bool,
    /// Live records whose identifiers changed.
    pub affected: Vec<RecipientId>,
    /// Records deleted by merges.
    pub merged_away: Vec<RecipientId>,
    /// Set when a change-number notice was emitted.
    pub changed_number: Option<RecipientId>,
    /// Operations that were applied.
    pub operations: Vec<PnpOperation>,
}

/// Authoritative recipient table plus the conversation and reference state merges touch.
#[derive(Debug, Default)]
pub struct RecipientStore {
    records: HashMap<RecipientId, RecipientRecord>,
    order: Vec<RecipientId>,
    by_e164: HashMap<String, RecipientId>,
    by_pni: HashMap<Pni, RecipientId>,
    by_service_id: HashMap<ServiceId, RecipientId>,
    threads: HashMap<ThreadId, ThreadRecord>,
    thread_by_recipient: HashMap<RecipientId, ThreadId>,
    messages: HashMap<MessageId, MessageRecord>,
    thread_messages: HashMap<ThreadId, Vec<MessageId>>,
    messages_by_author: HashMap<RecipientId, Vec<MessageId>>,
    refs: RefTables,
    remapped: HashMap<RecipientId, RecipientId>,
    pending_ops: Vec<StoredOp>,
    next_op_seq: OpSeq,
    next_recipient_id: RecipientId,
    next_thread_id: ThreadId,
    next_message_id: MessageId,
    next_row_id: RowId,
}

/// [`SessionOracle`] backed by the store's own session table.
pub struct SessionTable<'a>(&'a RefTables);

impl SessionOracle for SessionTable<'_> {
    fn has_session(&self, service_id: ServiceId) -> Result<bool, OracleError> {
        Ok(self.0.has_key(RefKind::Session, &service_id.to_string()))
    }
}

impl IdentityIndex for RecipientStore {
    fn id_by_e164(&self, e164: &str) -> Option<RecipientId> {
        self.by_e164.get(e164).copied()
    }

    fn id_by_pni_column(&self, pni: Pni) -> Option<RecipientId> {
        self.by_pni.get(&pni).copied()
    }

    fn id_by_service_id(&self, service_id: ServiceId) -> Option<RecipientId> {
        self.by_service_id.get(&service_id).copied()
    }

    fn record(&self, id: RecipientId) -> Option<&RecipientRecord> {
        self.records.get(&id)
    }
}

impl RecipientStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            next_op_seq: 1,
            next_recipient_id: 1,
            next_thread_id: 1,
            next_message_id: 1,
            next_row_id: 1,
            ..Self::default()
        }
    }

    /// Rebuilds a store and all of its indices from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Self {
        let mut store = Self {
            next_recipient_id: snapshot.next_recipient_id,
            next_thread_id: snapshot.next_thread_id,
            next_message_id: snapshot.next_message_id,
            next_row_id: snapshot.next_row_id,
            next_op_seq: snapshot.next_op_seq,
            order: snapshot.order,
            refs: RefTables::from_rows(snapshot.refs),
            remapped: snapshot.remapped.into_iter().collect(),
            ..Self::default()
        };

        for rec in snapshot.records {
            store.insert_indices(&rec);
            store.records.insert(rec.id, rec);
        }
        for thread in snapshot.threads {
            store.thread_by_recipient.insert(thread.recipient_id, thread.id);
            store.threads.insert(thread.id, thread);
        }
        for msg in snapshot.messages {
            store.index_message(&msg);
            store.messages.insert(msg.id, msg);
        }
        for ids in store.thread_messages.values_mut() {
            ids.sort_by_key(|id| {
                store
                    .messages
                    .get(id)
                    .map(|m| (m.sent_ms, m.id))
                    .unwrap_or((u64::MAX, *id))
            });
        }

        store
    }

    /// Exports current state.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let records = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect();

        let mut threads: Vec<ThreadRecord> = self.threads.values().cloned().collect();
        threads.sort_by_key(|t| t.id);
        let mut messages: Vec<MessageRecord> = self.messages.values().cloned().collect();
        messages.sort_by_key(|m| m.id);
        let mut remapped: Vec<(RecipientId, RecipientId)> =
            self.remapped.iter().map(|(k, v)| (*k, *v)).collect();
        remapped.sort_unstable();

        StoreSnapshotV1 {
            next_recipient_id: self.next_recipient_id,
            next_thread_id: self.next_thread_id,
            next_message_id: self.next_message_id,
            next_row_id: self.next_row_id,
            next_op_seq: self.next_op_seq,
            order: self.order.clone(),
            records,
            threads,
            messages,
            refs: self.refs.export_rows(),
            remapped,
        }
    }

    /// Resolves an observed tuple to a single recipient id.
    pub fn resolve(
        &mut self,
        request: &ResolveRequest,
        sessions: &dyn SessionOracle,
        local: &dyn LocalIdentityOracle,
    ) -> Result<RecipientId, ResolveError> {
        self.resolve_with_report(request, sessions, local)
            .map(|outcome| outcome.id)
    }

    /// Like [`Self::resolve`], answering session lookups from the store's own sessions.
    pub fn resolve_with_own_sessions(
        &mut self,
        request: &ResolveRequest,
        local: &dyn LocalIdentityOracle,
    ) -> Result<ResolveOutcome, ResolveError> {
        let change_set = self.plan(request, &SessionTable(&self.refs), local)?;
        self.commit(change_set, request.pni_verified)
    }

    /// Resolves a tuple and reports every record the resolution touched.
    pub fn resolve_with_report(
        &mut self,
        request: &ResolveRequest,
        sessions: &dyn SessionOracle,
        local: &dyn LocalIdentityOracle,
    ) -> Result<ResolveOutcome, ResolveError> {
        let change_set = self.plan(request, sessions, local)?;
        self.commit(change_set, request.pni_verified)
    }

    /// Matches and plans without mutating anything.
    pub fn plan(
        &self,
        request: &ResolveRequest,
        sessions: &dyn SessionOracle,
        local: &dyn LocalIdentityOracle,
    ) -> Result<ChangeSet, ResolveError> {
        let matches = matcher::find_matches(self, request);
        planner::plan(request, &matches, &PlanContext { sessions, local })
    }

    /// Session oracle view over this store's session table.
    pub fn session_oracle(&self) -> SessionTable<'_> {
        SessionTable(&self.refs)
    }

    fn commit(&mut self, change_set: ChangeSet, pni_verified: bool) -> Result<ResolveOutcome, ResolveError> {
        let operations = change_set.operations.clone();
        let merged_away = change_set.merged_away();
        let inserted = matches!(change_set.target, ChangeSetTarget::Insert(_));
        let (id, stored) = self.apply(change_set, pni_verified)?;
        if let Some(stored) = stored {
            self.pending_ops.push(stored);
        }

        let mut affected = Vec::new();
        let mut changed_number = None;
        for op in &operations {
            match op {
                PnpOperation::SetE164 { id, .. }
                | PnpOperation::SetPni { id, .. }
                | PnpOperation::SetAci { id, .. }
                | PnpOperation::RemoveE164 { id }
                | PnpOperation::RemovePni { id } => push_unique(&mut affected, *id),
                PnpOperation::Merge { primary, .. } => push_unique(&mut affected, *primary),
                PnpOperation::ChangeNumberNotice { id, .. } => changed_number = Some(*id),
                PnpOperation::SessionSwitchoverNotice { .. } => {}
            }
        }
        affected.retain(|id| !merged_away.contains(id));

        Ok(ResolveOutcome {
            id,
            inserted,
            affected,
            merged_away,
            changed_number,
            operations,
        })
    }

    /// Applies a change-set atomically. Returns the surviving id and, unless
    /// the change-set was a no-op, the journal entry for it.
    ///
    /// `pni_verified` is recorded on any record that receives a PNI.
    pub fn apply(
        &mut self,
        change_set: ChangeSet,
        pni_verified: bool,
    ) -> Result<(RecipientId, Option<StoredOp>), ResolveError> {
        if change_set.is_noop()
            && let ChangeSetTarget::Existing(id) = change_set.target
        {
            if !self.records.contains_key(&id) {
                return Err(ResolveError::MissingRecipient(id));
            }
            return Ok((id, None));
        }

        // Only a successful apply consumes the seq.
        let seq = self.next_op_seq;
        let (id, stored) = self.apply_with_seq(change_set, seq, now_ms(), pni_verified)?;
        Ok((id, Some(stored)))
    }

    fn apply_with_seq(
        &mut self,
        change_set: ChangeSet,
        seq: OpSeq,
        ts_ms: u64,
        pni_verified: bool,
    ) -> Result<(RecipientId, StoredOp), ResolveError> {
        let span = info_span!("apply_change_set", seq, ops = change_set.operations.len());
        let _guard = span.enter();

        if let Err(err) = self.check(&change_set) {
            warn!(%err, "change-set rejected");
            return Err(err);
        }

        let mut thread_merged: Vec<RecipientId> = Vec::new();
        for op in &change_set.operations {
            match op {
                PnpOperation::SetE164 { id, e164 } => {
                    self.mutate(*id, |rec| rec.e164 = Some(e164.clone()))?;
                }
                PnpOperation::SetPni { id, pni } => {
                    self.mutate(*id, |rec| {
                        rec.set_pni(*pni);
                        rec.pni_verified = pni_verified;
                    })?;
                }
                PnpOperation::SetAci { id, aci } => {
                    self.mutate(*id, |rec| rec.set_aci(*aci))?;
                }
                PnpOperation::RemoveE164 { id } => {
                    self.mutate(*id, |rec| rec.e164 = None)?;
                }
                PnpOperation::RemovePni { id } => {
                    self.mutate(*id, RecipientRecord::clear_pni)?;
                }
                PnpOperation::Merge { primary, secondary } => {
                    if self.merge(*primary, *secondary, ts_ms)? {
                        thread_merged.push(*primary);
                    }
                }
                PnpOperation::ChangeNumberNotice {
                    id,
                    old_e164,
                    new_e164,
                } => {
                    self.insert_event(
                        *id,
                        ts_ms,
                        MessageBody::ChangeNumber {
                            old_e164: old_e164.clone(),
                            new_e164: new_e164.clone(),
                        },
                    );
                }
                PnpOperation::SessionSwitchoverNotice { id, e164 } => {
                    if thread_merged.contains(id) {
                        debug!(id, "switchover event skipped after thread merge event");
                    } else {
                        self.insert_event(*id, ts_ms, MessageBody::SessionSwitchover { e164: e164.clone() });
                    }
                }
            }
        }

        let (id, inserted) = match &change_set.target {
            ChangeSetTarget::Existing(id) => (*id, None),
            ChangeSetTarget::Insert(fields) => {
                let id = self.insert_record(fields, pni_verified && fields.pni.is_some());
                info!(id, "inserted recipient");
                (id, Some(id))
            }
        };

        self.bump_next_seq_from(seq);
        let stored = StoredOp {
            seq,
            ts_ms,
            op: Op::Resolve {
                change_set,
                inserted,
                pni_verified,
            },
        };
        Ok((id, stored))
    }

    /// Replays `change_set` against a staged copy of the identifier columns.
    fn check(&self, change_set: &ChangeSet) -> Result<(), ResolveError> {
        let mut staged = Staged::new(self);

        for op in &change_set.operations {
            match op {
                PnpOperation::SetE164 { id, e164 } => {
                    staged.require(*id)?;
                    staged.claim_e164(*id, e164)?;
                }
                PnpOperation::SetPni { id, pni } => {
                    staged.require(*id)?;
                    staged.claim_pni(*id, *pni)?;
                }
                PnpOperation::SetAci { id, aci } => {
                    let current = staged.require(*id)?;
                    if current.aci.is_some_and(|existing| existing != *aci) {
                        return Err(ResolveError::conflict(format!("recipient {id} already has an aci")));
                    }
                    staged.claim_aci(*id, *aci)?;
                }
                PnpOperation::RemoveE164 { id } => {
                    staged.require(*id)?;
                    staged.release_e164(*id);
                }
                PnpOperation::RemovePni { id } => {
                    staged.require(*id)?;
                    staged.release_pni(*id);
                }
                PnpOperation::Merge { primary, secondary } => {
                    if primary == secondary {
                        return Err(ResolveError::conflict(format!("recipient {primary} merged into itself")));
                    }
                    let p = staged.require(*primary)?;
                    let s = staged.require(*secondary)?;
                    if let (Some(pa), Some(sa)) = (p.aci, s.aci)
                        && pa != sa
                    {
                        return Err(ResolveError::conflict(format!(
                            "merge of {secondary} into {primary} would change an aci"
                        )));
                    }
                    staged.delete(*secondary);
                    if p.e164.is_none()
                        && let Some(e164) = &s.e164
                    {
                        staged.claim_e164(*primary, e164)?;
                    }
                    if p.pni.is_none()
                        && let Some(pni) = s.pni
                    {
                        staged.claim_pni(*primary, pni)?;
                    }
                    if p.aci.is_none()
                        && let Some(aci) = s.aci
                    {
                        staged.claim_aci(*primary, aci)?;
                    }
                }
                PnpOperation::ChangeNumberNotice { id, .. } | PnpOperation::SessionSwitchoverNotice { id, .. } => {
                    staged.require(*id)?;
                }
            }
        }

        match &change_set.target {
            ChangeSetTarget::Existing(id) => {
                staged.require(*id)?;
            }
            ChangeSetTarget::Insert(fields) => {
                if fields.is_empty() {
                    return Err(ResolveError::InvalidTuple);
                }
                if let Some(e164) = &fields.e164 {
                    staged.ensure_free_e164(e164)?;
                }
                if let Some(pni) = fields.pni {
                    staged.ensure_free_pni(pni)?;
                }
                if let Some(aci) = fields.aci {
                    staged.ensure_free_aci(aci)?;
                }
            }
        }

        staged.ensure_none_empty()
    }

    fn mutate(
        &mut self,
        id: RecipientId,
        f: impl FnOnce(&mut RecipientRecord),
    ) -> Result<(), ResolveError> {
        let mut rec = self
            .records
            .remove(&id)
            .ok_or(ResolveError::MissingRecipient(id))?;
        self.remove_indices(&rec);
        f(&mut rec);
        self.insert_indices(&rec);
        self.records.insert(id, rec);
        Ok(())
    }

    /// Folds `secondary` into `primary`. Returns true when two threads were merged.
    fn merge(&mut self, primary: RecipientId, secondary: RecipientId, ts_ms: u64) -> Result<bool, ResolveError> {
        if !self.records.contains_key(&primary) {
            return Err(ResolveError::MissingRecipient(primary));
        }
        let sec = self
            .records
            .remove(&secondary)
            .ok_or(ResolveError::MissingRecipient(secondary))?;
        self.remove_indices(&sec);
        if let Some(pos) = self.order.iter().position(|id| *id == secondary) {
            self.order.remove(pos);
        }

        let thread_merged = self.merge_threads(primary, secondary);

        if let Some(ids) = self.messages_by_author.remove(&secondary) {
            for mid in &ids {
                if let Some(msg) = self.messages.get_mut(mid) {
                    msg.author = primary;
                }
            }
            self.messages_by_author.entry(primary).or_default().extend(ids);
        }

        let MigrationReport { moved, dropped } = self.refs.reassign_all(secondary, primary);

        self.mutate(primary, |rec| {
            if rec.e164.is_none() {
                rec.e164 = sec.e164.clone();
            }
            if rec.aci().is_none()
                && let Some(aci) = sec.aci()
            {
                rec.set_aci(aci);
            }
            if rec.pni.is_none()
                && let Some(pni) = sec.pni
            {
                rec.set_pni(pni);
                rec.pni_verified = sec.pni_verified;
            }
            rec.blocked |= sec.blocked;
        })?;

        self.remapped.insert(secondary, primary);

        if thread_merged {
            self.insert_event(
                primary,
                ts_ms,
                MessageBody::ThreadMerge {
                    previous_e164: sec.e164.clone(),
                },
            );
        }

        info!(primary, secondary, moved, dropped, thread_merged, "merged recipients");
        Ok(thread_merged)
    }

    fn merge_threads(&mut self, primary: RecipientId, secondary: RecipientId) -> bool {
        let Some(from) = self.thread_by_recipient.remove(&secondary) else {
            return false;
        };

        let Some(into) = self.thread_by_recipient.get(&primary).copied() else {
            if let Some(thread) = self.threads.get_mut(&from) {
                thread.recipient_id = primary;
            }
            self.thread_by_recipient.insert(primary, from);
            return false;
        };

        let moved = self.thread_messages.remove(&from).unwrap_or_default();
        for mid in &moved {
            if let Some(msg) = self.messages.get_mut(mid) {
                msg.thread_id = into;
            }
        }
        let mut ids = self.thread_messages.remove(&into).unwrap_or_default();
        ids.extend(moved);
        ids.sort_by_key(|id| {
            self.messages
                .get(id)
                .map(|m| (m.sent_ms, m.id))
                .unwrap_or((u64::MAX, *id))
        });
        self.thread_messages.insert(into, ids);
        self.threads.remove(&from);
        true
    }

    fn insert_event(&mut self, recipient: RecipientId, ts_ms: u64, body: MessageBody) -> Option<MessageId> {
        let Some(thread_id) = self.thread_by_recipient.get(&recipient).copied() else {
            debug!(recipient, "no thread for event, skipping");
            return None;
        };
        let id = self.next_message_id;
        self.next_message_id += 1;
        let msg = MessageRecord {
            id,
            thread_id,
            author: recipient,
            sent_ms: ts_ms,
            body,
        };
        self.index_message(&msg);
        self.messages.insert(id, msg);
        Some(id)
    }

    fn insert_record(&mut self, fields: &IdentityFields, pni_verified: bool) -> RecipientId {
        let id = self.next_recipient_id;
        self.next_recipient_id += 1;
        let rec = RecipientRecord::new(id, fields, pni_verified);
        self.insert_indices(&rec);
        self.order.push(id);
        self.records.insert(id, rec);
        id
    }

    /// Opens the one-to-one thread with `recipient_id`.
    pub fn create_thread(&mut self, recipient_id: RecipientId) -> Result<(ThreadId, StoredOp), StoreError> {
        let thread_id = self.next_thread_id;
        let seq = self.next_op_seq;
        let stored = self.apply_create_thread_with_seq(thread_id, recipient_id, seq, now_ms())?;
        self.pending_ops.push(stored.clone());
        Ok((thread_id, stored))
    }

    fn apply_create_thread_with_seq(
        &mut self,
        thread_id: ThreadId,
        recipient_id: RecipientId,
        seq: OpSeq,
        ts_ms: u64,
    ) -> Result<StoredOp, StoreError> {
        if !self.records.contains_key(&recipient_id) {
            return Err(StoreError::MissingRecipient(recipient_id));
        }
        if self.thread_by_recipient.contains_key(&recipient_id) {
            return Err(StoreError::ThreadExists(recipient_id));
        }

        self.next_thread_id = self.next_thread_id.max(thread_id.saturating_add(1));
        self.threads.insert(
            thread_id,
            ThreadRecord {
                id: thread_id,
                recipient_id,
            },
        );
        self.thread_by_recipient.insert(recipient_id, thread_id);

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms,
            op: Op::CreateThread {
                thread_id,
                recipient_id,
            },
        })
    }

    /// Appends a message to a thread.
    pub fn insert_message(&mut self, draft: MessageDraft) -> Result<(MessageId, StoredOp), StoreError> {
        let id = self.next_message_id;
        let msg = MessageRecord {
            id,
            thread_id: draft.thread_id,
            author: draft.author,
            sent_ms: draft.sent_ms,
            body: draft.body,
        };
        let seq = self.next_op_seq;
        let stored = self.apply_insert_message_with_seq(msg, seq, now_ms())?;
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    fn apply_insert_message_with_seq(
        &mut self,
        message: MessageRecord,
        seq: OpSeq,
        ts_ms: u64,
    ) -> Result<StoredOp, StoreError> {
        if !self.threads.contains_key(&message.thread_id) {
            return Err(StoreError::MissingThread(message.thread_id));
        }
        if !self.records.contains_key(&message.author) {
            return Err(StoreError::MissingRecipient(message.author));
        }

        self.next_message_id = self.next_message_id.max(message.id.saturating_add(1));
        self.index_message(&message);
        self.messages.insert(message.id, message.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms,
            op: Op::InsertMessage { message },
        })
    }

    /// Adds a dependent row pointing at a recipient.
    pub fn add_reference(&mut self, draft: RefDraft) -> Result<(RowId, StoredOp), StoreError> {
        let row = RefRow {
            id: self.next_row_id,
            kind: draft.kind,
            owner: draft.owner,
            subject: draft.subject,
            key: draft.key,
        };
        let id = row.id;
        let seq = self.next_op_seq;
        let stored = self.apply_add_reference_with_seq(row, seq, now_ms())?;
        self.pending_ops.push(stored.clone());
        Ok((id, stored))
    }

    fn apply_add_reference_with_seq(&mut self, row: RefRow, seq: OpSeq, ts_ms: u64) -> Result<StoredOp, StoreError> {
        if !self.records.contains_key(&row.owner) {
            return Err(StoreError::MissingRecipient(row.owner));
        }
        if let Some(subject) = row.subject
            && !self.messages.contains_key(&subject)
        {
            return Err(StoreError::MissingMessage(subject));
        }

        self.next_row_id = self.next_row_id.max(row.id.saturating_add(1));
        self.refs.insert(row.clone());

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms,
            op: Op::AddReference { row },
        })
    }

    /// Sets or clears the blocked flag.
    pub fn set_blocked(&mut self, id: RecipientId, blocked: bool) -> Result<((), StoredOp), StoreError> {
        let seq = self.next_op_seq;
        let stored = self.apply_set_blocked_with_seq(id, blocked, seq, now_ms())?;
        self.pending_ops.push(stored.clone());
        Ok(((), stored))
    }

    fn apply_set_blocked_with_seq(
        &mut self,
        id: RecipientId,
        blocked: bool,
        seq: OpSeq,
        ts_ms: u64,
    ) -> Result<StoredOp, StoreError> {
        let rec = self
            .records
            .get_mut(&id)
            .ok_or(StoreError::MissingRecipient(id))?;
        rec.blocked = blocked;

        self.bump_next_seq_from(seq);
        Ok(StoredOp {
            seq,
            ts_ms,
            op: Op::SetBlocked { id, blocked },
        })
    }

    /// Re-applies a journaled op during recovery. Change-sets are applied as journaled, never re-planned.
    pub fn apply_replayed_op(&mut self, stored: StoredOp) -> Result<(), StoreError> {
        let seq = stored.seq;
        let ts_ms = stored.ts_ms;
        match stored.op {
            Op::Resolve {
                change_set,
                inserted,
                pni_verified,
            } => {
                let (id, _) = self
                    .apply_with_seq(change_set, seq, ts_ms, pni_verified)
                    .map_err(|source| StoreError::Replay { seq, source })?;
                if let Some(expected) = inserted
                    && expected != id
                {
                    return Err(StoreError::ReplayMismatch {
                        seq,
                        expected,
                        actual: id,
                    });
                }
            }
            Op::CreateThread {
                thread_id,
                recipient_id,
            } => {
                self.apply_create_thread_with_seq(thread_id, recipient_id, seq, ts_ms)?;
            }
            Op::InsertMessage { message } => {
                self.apply_insert_message_with_seq(message, seq, ts_ms)?;
            }
            Op::AddReference { row } => {
                self.apply_add_reference_with_seq(row, seq, ts_ms)?;
            }
            Op::SetBlocked { id, blocked } => {
                self.apply_set_blocked_with_seq(id, blocked, seq, ts_ms)?;
            }
        }
        Ok(())
    }

    /// Record by id.
    pub fn get(&self, id: RecipientId) -> Option<&RecipientRecord> {
        self.records.get(&id)
    }

    /// Owned copy of a record.
    pub fn get_cloned(&self, id: RecipientId) -> Option<RecipientRecord> {
        self.get(id).cloned()
    }

    /// Record holding `e164`.
    pub fn by_e164(&self, e164: &str) -> Option<&RecipientRecord> {
        self.id_by_e164(e164).and_then(|id| self.records.get(&id))
    }

    /// Record holding `pni`, by column first and then by service id.
    pub fn by_pni(&self, pni: Pni) -> Option<&RecipientRecord> {
        self.id_by_pni_column(pni)
            .or_else(|| self.id_by_service_id(ServiceId::Pni(pni)))
            .and_then(|id| self.records.get(&id))
    }

    /// Record whose service id is `aci`.
    pub fn by_aci(&self, aci: Aci) -> Option<&RecipientRecord> {
        self.id_by_service_id(ServiceId::Aci(aci))
            .and_then(|id| self.records.get(&id))
    }

    /// Follows merge history from `id` to the live record that absorbed it.
    pub fn remapped(&self, id: RecipientId) -> Option<RecipientId> {
        let mut current = id;
        let mut seen = HashSet::new();
        while !self.records.contains_key(&current) {
            if !seen.insert(current) {
                return None;
            }
            current = *self.remapped.get(&current)?;
        }
        Some(current)
    }

    /// Thread owned by a recipient.
    pub fn thread_for(&self, recipient_id: RecipientId) -> Option<ThreadId> {
        self.thread_by_recipient.get(&recipient_id).copied()
    }

    /// Thread by id.
    pub fn thread(&self, thread_id: ThreadId) -> Option<&ThreadRecord> {
        self.threads.get(&thread_id)
    }

    /// Messages of a thread in send order.
    pub fn thread_messages(&self, thread_id: ThreadId) -> Vec<&MessageRecord> {
        self.thread_messages
            .get(&thread_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.messages.get(id))
            .collect()
    }

    /// Owned copy of [`Self::thread_messages`].
    pub fn thread_messages_cloned(&self, thread_id: ThreadId) -> Vec<MessageRecord> {
        self.thread_messages(thread_id).into_iter().cloned().collect()
    }

    /// Message by id.
    pub fn message(&self, id: MessageId) -> Option<&MessageRecord> {
        self.messages.get(&id)
    }

    /// Messages authored by `author`.
    pub fn messages_by_author(&self, author: RecipientId) -> Vec<&MessageRecord> {
        self.messages_by_author
            .get(&author)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.messages.get(id))
            .collect()
    }

    /// Dependent rows of `kind` owned by `owner`.
    pub fn references(&self, kind: RefKind, owner: RecipientId) -> Vec<&RefRow> {
        self.refs.rows_for(kind, owner)
    }

    /// Number of dependent rows of any kind owned by `owner`.
    pub fn reference_count(&self, owner: RecipientId) -> usize {
        self.refs.count_for(owner)
    }

    /// Live record ids in creation order.
    pub fn ordered_ids(&self) -> &[RecipientId] {
        &self.order
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record exists.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Takes ops not yet handed to persistence.
    pub fn drain_pending_ops(&mut self) -> Vec<StoredOp> {
        std::mem::take(&mut self.pending_ops)
    }

    /// Sequence of the last applied op, 0 when none.
    pub fn latest_op_seq(&self) -> OpSeq {
        self.next_op_seq.saturating_sub(1)
    }

    fn index_message(&mut self, msg: &MessageRecord) {
        let ids = self.thread_messages.entry(msg.thread_id).or_default();
        let key = (msg.sent_ms, msg.id);
        let messages = &self.messages;
        let pos = ids
            .iter()
            .position(|id| {
                messages
                    .get(id)
                    .is_some_and(|m| (m.sent_ms, m.id) > key)
            })
            .unwrap_or(ids.len());
        ids.insert(pos, msg.id);
        self.messages_by_author.entry(msg.author).or_default().push(msg.id);
    }

    fn insert_indices(&mut self, rec: &RecipientRecord) {
        if let Some(e164) = &rec.e164 {
            self.by_e164.insert(e164.clone(), rec.id);
        }
        if let Some(pni) = rec.pni {
            self.by_pni.insert(pni, rec.id);
        }
        if let Some(service_id) = rec.service_id {
            self.by_service_id.insert(service_id, rec.id);
        }
    }

    fn remove_indices(&mut self, rec: &RecipientRecord) {
        if let Some(e164) = &rec.e164
            && self.by_e164.get(e164) == Some(&rec.id)
        {
            self.by_e164.remove(e164);
        }
        if let Some(pni) = rec.pni
            && self.by_pni.get(&pni) == Some(&rec.id)
        {
            self.by_pni.remove(&pni);
        }
        if let Some(service_id) = rec.service_id
            && self.by_service_id.get(&service_id) == Some(&rec.id)
        {
            self.by_service_id.remove(&service_id);
        }
    }

    fn bump_next_seq_from(&mut self, seq: OpSeq) {
        self.next_op_seq = self.next_op_seq.max(seq.saturating_add(1));
    }
}

/// Identifier columns of touched records, overlaid on the live indices.
struct Staged<'a> {
    store: &'a RecipientStore,
    fields: HashMap<RecipientId, Option<IdentityFields>>,
    e164_owner: HashMap<String, Option<RecipientId>>,
    pni_owner: HashMap<Pni, Option<RecipientId>>,
    aci_owner: HashMap<Aci, Option<RecipientId>>,
}

impl<'a> Staged<'a> {
    fn new(store: &'a RecipientStore) -> Self {
        Self {
            store,
            fields: HashMap::new(),
            e164_owner: HashMap::new(),
            pni_owner: HashMap::new(),
            aci_owner: HashMap::new(),
        }
    }

    fn current(&self, id: RecipientId) -> Option<IdentityFields> {
        match self.fields.get(&id) {
            Some(staged) => staged.clone(),
            None => self.store.records.get(&id).map(RecipientRecord::fields),
        }
    }

    fn require(&self, id: RecipientId) -> Result<IdentityFields, ResolveError> {
        self.current(id).ok_or(ResolveError::MissingRecipient(id))
    }

    fn e164_holder(&self, e164: &str) -> Option<RecipientId> {
        match self.e164_owner.get(e164) {
            Some(owner) => *owner,
            None => self.store.id_by_e164(e164),
        }
    }

    fn pni_holder(&self, pni: Pni) -> Option<RecipientId> {
        match self.pni_owner.get(&pni) {
            Some(owner) => *owner,
            None => self
                .store
                .id_by_pni_column(pni)
                .or_else(|| self.store.id_by_service_id(ServiceId::Pni(pni))),
        }
    }

    fn aci_holder(&self, aci: Aci) -> Option<RecipientId> {
        match self.aci_owner.get(&aci) {
            Some(owner) => *owner,
            None => self.store.id_by_service_id(ServiceId::Aci(aci)),
        }
    }

    fn ensure_free_e164(&self, e164: &str) -> Result<(), ResolveError> {
        match self.e164_holder(e164) {
            Some(owner) => Err(ResolveError::conflict(format!("e164 already held by {owner}"))),
            None => Ok(()),
        }
    }

    fn ensure_free_pni(&self, pni: Pni) -> Result<(), ResolveError> {
        match self.pni_holder(pni) {
            Some(owner) => Err(ResolveError::conflict(format!("pni already held by {owner}"))),
            None => Ok(()),
        }
    }

    fn ensure_free_aci(&self, aci: Aci) -> Result<(), ResolveError> {
        match self.aci_holder(aci) {
            Some(owner) => Err(ResolveError::conflict(format!("aci already held by {owner}"))),
            None => Ok(()),
        }
    }

    fn update(&mut self, id: RecipientId, f: impl FnOnce(&mut IdentityFields)) -> Result<(), ResolveError> {
        let mut fields = self.require(id)?;
        f(&mut fields);
        self.fields.insert(id, Some(fields));
        Ok(())
    }

    fn claim_e164(&mut self, id: RecipientId, e164: &str) -> Result<(), ResolveError> {
        if self.e164_holder(e164).is_some_and(|owner| owner != id) {
            return self.ensure_free_e164(e164);
        }
        self.release_e164(id);
        self.e164_owner.insert(e164.to_string(), Some(id));
        self.update(id, |f| f.e164 = Some(e164.to_string()))
    }

    fn claim_pni(&mut self, id: RecipientId, pni: Pni) -> Result<(), ResolveError> {
        if self.pni_holder(pni).is_some_and(|owner| owner != id) {
            return self.ensure_free_pni(pni);
        }
        self.release_pni(id);
        self.pni_owner.insert(pni, Some(id));
        self.update(id, |f| f.pni = Some(pni))
    }

    fn claim_aci(&mut self, id: RecipientId, aci: Aci) -> Result<(), ResolveError> {
        if self.aci_holder(aci).is_some_and(|owner| owner != id) {
            return self.ensure_free_aci(aci);
        }
        self.aci_owner.insert(aci, Some(id));
        self.update(id, |f| f.aci = Some(aci))
    }

    fn release_e164(&mut self, id: RecipientId) {
        if let Some(e164) = self.current(id).and_then(|f| f.e164) {
            self.e164_owner.insert(e164, None);
            let _ = self.update(id, |f| f.e164 = None);
        }
    }

    fn release_pni(&mut self, id: RecipientId) {
        if let Some(pni) = self.current(id).and_then(|f| f.pni) {
            self.pni_owner.insert(pni, None);
            let _ = self.update(id, |f| f.pni = None);
        }
    }

    fn delete(&mut self, id: RecipientId) {
        if let Some(fields) = self.current(id) {
            if let Some(e164) = fields.e164 {
                self.e164_owner.insert(e164, None);
            }
            if let Some(pni) = fields.pni {
                self.pni_owner.insert(pni, None);
            }
            if let Some(aci) = fields.aci {
                self.aci_owner.insert(aci, None);
            }
        }
        self.fields.insert(id, None);
    }

    fn ensure_none_empty(&self) -> Result<(), ResolveError> {
        for (id, fields) in &self.fields {
            if fields.as_ref().is_some_and(IdentityFields::is_empty) {
                return Err(ResolveError::conflict(format!("recipient {id} would be left without identifiers")));
            }
        }
        Ok(())
    }
}

fn push_unique(v: &mut Vec<RecipientId>, id: RecipientId) {
    if !v.contains(&id) {
        v.push(id);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
