//! Persistence abstraction and SQLite implementation.

/// SQLite journal and snapshot sink.
pub mod sqlite;

use thiserror::Error;

use crate::{
    core::{error::StoreError, store::StoreSnapshotV1},
    op::StoredOp,
    types::OpSeq,
};

/// Failure of the journal or snapshot layer.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite rejected a statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A payload could not be encoded or decoded.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Replaying the journal into a store failed.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Anything else, such as an unsupported format version.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Destination for journaled ops. Called from a blocking worker thread.
pub trait OpSink: Send {
    /// Appends ops in order and returns the last durable sequence.
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    /// Forces buffered state to disk.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    /// Stores a snapshot that covers every op up to `last_seq`.
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    /// Drops journal rows up to and including `seq`.
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
