//! Runtime event stream payloads.

use crate::types::{OpSeq, RecipientId, ThreadId};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientEvent {
    /// A resolution created a new recipient.
    Inserted {
        /// New recipient id.
        id: RecipientId,
    },
    /// A recipient's identifiers changed.
    Updated {
        /// Changed recipient id.
        id: RecipientId,
    },
    /// `secondary` was folded into `primary` and no longer exists.
    Merged {
        /// Survivor.
        primary: RecipientId,
        /// Deleted record; [`crate::core::store::RecipientStore::remapped`] resolves it.
        secondary: RecipientId,
    },
    /// A known account changed its phone number.
    NumberChanged {
        /// Recipient whose number changed.
        id: RecipientId,
    },
    /// A recipient's PNI changed while a session existed for the old one.
    SessionSwitchover {
        /// Recipient that switched.
        id: RecipientId,
    },
    /// A thread was opened.
    ThreadCreated {
        /// New thread.
        thread_id: ThreadId,
        /// Owning recipient.
        recipient_id: RecipientId,
    },
    /// The blocked flag changed.
    BlockedChanged {
        /// Recipient.
        id: RecipientId,
        /// New value.
        blocked: bool,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        op_seq: OpSeq,
    },
}
