//! Journal operation model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    changeset::{ChangeSet, ChangeSetTarget, PnpOperation},
    conversation::MessageRecord,
    core::refs::RefRow,
    types::{OpSeq, RecipientId, ThreadId},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable operation appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// An applied change-set. Replay applies it as-is.
    Resolve {
        /// Applied change-set.
        change_set: ChangeSet,
        /// Id assigned when the target was an insert.
        inserted: Option<RecipientId>,
        /// Whether the resolved PNI was verified.
        #[serde(default)]
        pni_verified: bool,
    },
    /// Open a thread with a recipient.
    CreateThread {
        /// Assigned thread id.
        thread_id: ThreadId,
        /// Owning recipient.
        recipient_id: RecipientId,
    },
    /// Append a message.
    InsertMessage {
        /// Fully materialized message.
        message: MessageRecord,
    },
    /// Add a dependent row.
    AddReference {
        /// Fully materialized row.
        row: RefRow,
    },
    /// Block or unblock a recipient.
    SetBlocked {
        /// Recipient to mutate.
        id: RecipientId,
        /// New flag value.
        blocked: bool,
    },
}

impl Op {
    /// Every recipient the op touches, each once, target first.
    ///
    /// A resolution lists its survivor, then every record an operation named,
    /// including merge secondaries that no longer exist afterwards.
    pub fn recipients(&self) -> Vec<RecipientId> {
        match self {
            Op::Resolve {
                change_set,
                inserted,
                ..
            } => {
                let mut ids = Vec::with_capacity(change_set.operations.len() + 1);
                let target = match change_set.target {
                    ChangeSetTarget::Existing(id) => Some(id),
                    ChangeSetTarget::Insert(_) => *inserted,
                };
                ids.extend(target);
                for op in &change_set.operations {
                    let named = match op {
                        PnpOperation::Merge { primary, secondary } => [Some(*primary), Some(*secondary)],
                        PnpOperation::SetE164 { id, .. }
                        | PnpOperation::SetPni { id, .. }
                        | PnpOperation::SetAci { id, .. }
                        | PnpOperation::RemoveE164 { id }
                        | PnpOperation::RemovePni { id }
                        | PnpOperation::ChangeNumberNotice { id, .. }
                        | PnpOperation::SessionSwitchoverNotice { id, .. } => [Some(*id), None],
                    };
                    for id in named.into_iter().flatten() {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                ids
            }
            Op::CreateThread { recipient_id, .. } => vec![*recipient_id],
            Op::InsertMessage { message } => vec![message.author],
            Op::AddReference { row } => vec![row.owner],
            Op::SetBlocked { id, .. } => vec![*id],
        }
    }
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOp {
    /// Monotonic operation sequence.
    pub seq: OpSeq,
    /// Operation timestamp in milliseconds.
    pub ts_ms: u64,
    /// Operation body.
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped operation.
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    /// Wraps `stored` with the current [`OP_FORMAT_VERSION`].
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
