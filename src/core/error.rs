//! Error types for the recipient store.
//!
//! [`ResolveError`] covers the match/plan/apply pipeline for one observed
//! tuple. [`StoreError`] covers every other mutation and journal replay.

use thiserror::Error;

use crate::{
    oracle::OracleError,
    types::{MessageId, OpSeq, RecipientId, ThreadId},
};

/// Failure of a single `resolve` call. Storage is unchanged when returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// e164, pni and aci were all absent.
    #[error("invalid tuple: at least one of e164, pni or aci is required")]
    InvalidTuple,

    /// The change-set no longer fits the current state; retry the whole resolve.
    #[error("resolution conflict: {reason}")]
    ResolutionConflict {
        /// Which invariant the change-set would have broken.
        reason: String,
    },

    /// A collaborator could not answer.
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// A change-set named a recipient that does not exist.
    #[error("recipient {0} does not exist")]
    MissingRecipient(RecipientId),
}

impl ResolveError {
    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Self::ResolutionConflict {
            reason: reason.into(),
        }
    }
}

/// Failure of a direct store mutation or of journal replay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No such recipient.
    #[error("recipient {0} does not exist")]
    MissingRecipient(RecipientId),

    /// No such thread.
    #[error("thread {0} does not exist")]
    MissingThread(ThreadId),

    /// No such message.
    #[error("message {0} does not exist")]
    MissingMessage(MessageId),

    /// The recipient already owns a thread.
    #[error("recipient {0} already has a thread")]
    ThreadExists(RecipientId),

    /// A replayed change-set failed to apply.
    #[error("replay of op {seq} failed: {source}")]
    Replay {
        /// Sequence of the failing op.
        seq: OpSeq,
        /// Underlying failure.
        source: ResolveError,
    },

    /// A replayed op produced a different id than the one journaled.
    #[error("replay of op {seq} assigned id {actual}, journal recorded {expected}")]
    ReplayMismatch {
        /// Sequence of the failing op.
        seq: OpSeq,
        /// Journaled id.
        expected: u64,
        /// Id assigned during replay.
        actual: u64,
    },
}
