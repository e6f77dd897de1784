use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, RecipientId, RowId};

/// Dependent table holding rows that point at a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefKind {
    /// `@`-mention spans inside message bodies.
    Mention,
    /// Emoji reactions on messages.
    Reaction,
    /// Per-member delivery receipts in group messages.
    GroupReceipt,
    /// Protocol sessions; `key` is the session address.
    Session,
    /// Stored identity keys; `key` is the address.
    IdentityKey,
    /// Notification-profile allow-list entries; `key` is the profile.
    NotificationAllowList,
    /// Distribution-list memberships; `key` is the list.
    DistributionMembership,
    /// Change-number requests awaiting completion.
    PendingChangeNumber,
}

/// What happens to a secondary's row when the primary already holds an equal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Always move the row.
    Reassign,
    /// Move the row unless the primary already has the same `(subject, key)`.
    ReassignDedup,
}

/// Reference kinds rewired by a merge, in migration order.
pub const REFERENCE_MANIFEST: &[(RefKind, MergeRule)] = &[
    (RefKind::Mention, MergeRule::Reassign),
    (RefKind::Reaction, MergeRule::ReassignDedup),
    (RefKind::GroupReceipt, MergeRule::ReassignDedup),
    (RefKind::Session, MergeRule::Reassign),
    (RefKind::IdentityKey, MergeRule::Reassign),
    (RefKind::NotificationAllowList, MergeRule::ReassignDedup),
    (RefKind::DistributionMembership, MergeRule::ReassignDedup),
    (RefKind::PendingChangeNumber, MergeRule::Reassign),
];

/// One row of a dependent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRow {
    /// Row identifier.
    pub id: RowId,
    /// Table the row belongs to.
    pub kind: RefKind,
    /// Recipient the row points at.
    pub owner: RecipientId,
    /// Message the row is attached to, for message-scoped kinds.
    pub subject: Option<MessageId>,
    /// Kind-specific key (address, list, profile, emoji).
    pub key: String,
}

/// Insert payload for a [`RefRow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDraft {
    /// Table to insert into.
    pub kind: RefKind,
    /// Recipient the row points at.
    pub owner: RecipientId,
    /// Message the row is attached to.
    pub subject: Option<MessageId>,
    /// Kind-specific key.
    pub key: String,
}

/// Outcome of rewiring one recipient's references onto another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Rows whose owner was rewritten.
    pub moved: usize,
    /// Rows dropped because the primary already held an equal row.
    pub dropped: usize,
}

#[derive(Debug, Default, Clone)]
struct RefTable {
    rows: HashMap<RowId, RefRow>,
    by_owner: HashMap<RecipientId, Vec<RowId>>,
    by_key: HashMap<String, Vec<RowId>>,
}

impl RefTable {
    fn insert(&mut self, row: RefRow) {
        self.by_owner.entry(row.owner).or_default().push(row.id);
        self.by_key.entry(row.key.clone()).or_default().push(row.id);
        self.rows.insert(row.id, row);
    }

    fn remove(&mut self, id: RowId) -> Option<RefRow> {
        let row = self.rows.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&row.key) {
            remove_id(ids, id);
            if ids.is_empty() {
                self.by_key.remove(&row.key);
            }
        }
        Some(row)
    }

    fn owned_by(&self, owner: RecipientId) -> impl Iterator<Item = &RefRow> {
        self.by_owner
            .get(&owner)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.rows.get(id))
    }

    fn reassign(&mut self, from: RecipientId, to: RecipientId, rule: MergeRule) -> MigrationReport {
        let mut report = MigrationReport::default();
        let Some(ids) = self.by_owner.remove(&from) else {
            return report;
        };

        for id in ids {
            let duplicate = rule == MergeRule::ReassignDedup
                && self.rows.get(&id).is_some_and(|row| {
                    self.owned_by(to)
                        .any(|other| other.subject == row.subject && other.key == row.key)
                });

            if duplicate {
                self.remove(id);
                report.dropped += 1;
            } else if let Some(row) = self.rows.get_mut(&id) {
                row.owner = to;
                self.by_owner.entry(to).or_default().push(id);
                report.moved += 1;
            }
        }
        report
    }
}

/// All dependent tables named in [`REFERENCE_MANIFEST`].
#[derive(Debug, Default, Clone)]
pub struct RefTables {
    tables: HashMap<RefKind, RefTable>,
}

impl RefTables {
    /// Rebuilds the tables and their indices from exported rows.
    pub fn from_rows(rows: impl IntoIterator<Item = RefRow>) -> Self {
        let mut tables = Self::default();
        for row in rows {
            tables.insert(row);
        }
        tables
    }

    /// Inserts a row.
    pub fn insert(&mut self, row: RefRow) {
        self.tables.entry(row.kind).or_default().insert(row);
    }

    /// Rows of `kind` currently pointing at `owner`, ordered by row id.
    pub fn rows_for(&self, kind: RefKind, owner: RecipientId) -> Vec<&RefRow> {
        let mut out: Vec<&RefRow> = self
            .tables
            .get(&kind)
            .into_iter()
            .flat_map(|t| t.owned_by(owner))
            .collect();
        out.sort_by_key(|row| row.id);
        out
    }

    /// Total number of rows of any kind pointing at `owner`.
    pub fn count_for(&self, owner: RecipientId) -> usize {
        self.tables.values().map(|t| t.owned_by(owner).count()).sum()
    }

    /// True when any row of `kind` carries `key`.
    pub fn has_key(&self, kind: RefKind, key: &str) -> bool {
        self.tables
            .get(&kind)
            .and_then(|t| t.by_key.get(key))
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Rewires every manifest kind from `from` to `to`.
    pub fn reassign_all(&mut self, from: RecipientId, to: RecipientId) -> MigrationReport {
        let mut total = MigrationReport::default();
        for (kind, rule) in REFERENCE_MANIFEST {
            if let Some(table) = self.tables.get_mut(kind) {
                let report = table.reassign(from, to, *rule);
                total.moved += report.moved;
                total.dropped += report.dropped;
            }
        }
        total
    }

    /// Every row, ordered by row id.
    pub fn export_rows(&self) -> Vec<RefRow> {
        let mut out: Vec<RefRow> = self
            .tables
            .values()
            .flat_map(|t| t.rows.values().cloned())
            .collect();
        out.sort_by_key(|row| row.id);
        out
    }
}

fn remove_id(v: &mut Vec<RowId>, id: RowId) {
    if let Some(pos) = v.iter().position(|x| *x == id) {
        v.remove(pos);
    }
}
