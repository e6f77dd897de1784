//! Recipient journal on SQLite.
//!
//! Ops live in `journal`, keyed by their seq. `journal_recipients` maps every
//! recipient an op touched to that op, so the history of a record survives the
//! merge that deleted it. `checkpoints` holds full store snapshots; loading
//! starts from the newest one and replays the journal tail on top.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Params, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    core::store::{RecipientStore, StoreSnapshotV1},
    op::{OP_FORMAT_VERSION, Op, StoredOp, StoredOpEnvelope},
    types::{OpSeq, RecipientId},
};

use super::{OpSink, PersistError, PersistResult};

/// Value of `PRAGMA user_version` for the current table layout.
const SCHEMA_VERSION: i64 = 1;
const CHECKPOINT_FORMAT_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope<S> {
    format_version: u16,
    snapshot: S,
}

/// Journal and checkpoint store for a [`RecipientStore`].
pub struct SqliteOpSink {
    conn: Connection,
}

impl SqliteOpSink {
    /// Opens or creates a journal at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        Self::prepare(Connection::open(path)?)
    }

    /// Journal that lives as long as the value.
    pub fn open_in_memory() -> PersistResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> PersistResult<Self> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(PersistError::Message(format!(
                "journal schema {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Newest checkpoint plus every journaled op after it.
    pub fn load_store(&self) -> PersistResult<RecipientStore> {
        let mut store = self
            .latest_checkpoint()?
            .map(RecipientStore::from_snapshot)
            .unwrap_or_else(RecipientStore::new);

        let from = store.latest_op_seq();
        let tail = self.load_events_after(from)?;
        let replayed = tail.len();
        for stored in tail {
            store.apply_replayed_op(stored)?;
        }
        info!(from, replayed, recipients = store.len(), "recipient store loaded");
        Ok(store)
    }

    /// Journaled ops with a seq above `seq`, in order.
    pub fn load_events_after(&self, seq: OpSeq) -> PersistResult<Vec<StoredOp>> {
        self.query_ops(
            "SELECT seq, ts_ms, payload FROM journal WHERE seq > ?1 ORDER BY seq",
            params![seq as i64],
        )
    }

    /// Every journaled op that touched `recipient_id`, merged-away ids included.
    pub fn events_for_recipient(&self, recipient_id: RecipientId) -> PersistResult<Vec<StoredOp>> {
        self.query_ops(
            "SELECT j.seq, j.ts_ms, j.payload
             FROM journal_recipients r JOIN journal j ON j.seq = r.seq
             WHERE r.recipient_id = ?1
             ORDER BY j.seq",
            params![recipient_id as i64],
        )
    }

    /// Stores `snapshot` as the state after op `last_seq`.
    pub fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        let payload = serde_json::to_vec(&CheckpointEnvelope {
            format_version: CHECKPOINT_FORMAT_VERSION,
            snapshot,
        })?;
        self.conn.execute(
            "INSERT INTO checkpoints(last_seq, ts_ms, recipients, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                last_seq as i64,
                now_ms() as i64,
                snapshot.records.len() as i64,
                payload
            ],
        )?;
        debug!(last_seq, recipients = snapshot.records.len(), bytes = payload.len(), "checkpoint written");
        Ok(())
    }

    /// Drops journaled ops through `seq` along with their recipient index rows.
    pub fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM journal_recipients WHERE seq <= ?1", params![seq as i64])?;
        let removed = tx.execute("DELETE FROM journal WHERE seq <= ?1", params![seq as i64])?;
        tx.commit()?;
        debug!(seq, removed, "journal compacted");
        Ok(removed)
    }

    /// Highest journaled seq, 0 when the journal is empty.
    pub fn latest_seq(&self) -> PersistResult<OpSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM journal", [], |row| row.get(0))?;
        Ok(seq.map_or(0, |s| s as OpSeq))
    }

    fn query_ops(&self, sql: &str, args: impl Params) -> PersistResult<Vec<StoredOp>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: Vec<u8> = row.get(2)?;
            let mut stored = decode_stored_op(&payload)?;
            stored.seq = row.get::<_, i64>(0)? as OpSeq;
            stored.ts_ms = row.get::<_, i64>(1)? as u64;
            out.push(stored);
        }
        Ok(out)
    }

    fn latest_checkpoint(&self) -> PersistResult<Option<StoreSnapshotV1>> {
        let Some(payload) = self
            .conn
            .query_row("SELECT payload FROM checkpoints ORDER BY id DESC LIMIT 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
        else {
            return Ok(None);
        };

        let envelope: CheckpointEnvelope<StoreSnapshotV1> = serde_json::from_slice(&payload)?;
        if envelope.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(PersistError::Message(format!(
                "unsupported checkpoint format {}",
                envelope.format_version
            )));
        }
        Ok(Some(envelope.snapshot))
    }
}

impl OpSink for SqliteOpSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        let Some(last) = ops.last() else {
            return self.latest_seq();
        };

        let tx = self.conn.transaction()?;
        {
            let mut journal =
                tx.prepare_cached("INSERT INTO journal(seq, ts_ms, kind, payload) VALUES (?1, ?2, ?3, ?4)")?;
            let mut touched =
                tx.prepare_cached("INSERT OR IGNORE INTO journal_recipients(recipient_id, seq) VALUES (?1, ?2)")?;
            for stored in ops {
                let payload = serde_json::to_vec(&StoredOpEnvelope::new(stored.clone()))?;
                journal.execute(params![
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    op_kind(&stored.op),
                    payload
                ])?;
                for recipient_id in stored.op.recipients() {
                    touched.execute(params![recipient_id as i64, stored.seq as i64])?;
                }
            }
        }
        tx.commit()?;
        Ok(last.seq)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        SqliteOpSink::write_snapshot(self, snapshot, last_seq)
    }

    fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        SqliteOpSink::compact_through(self, seq)
    }
}

fn op_kind(op: &Op) -> &'static str {
    match op {
        Op::Resolve { .. } => "resolve",
        Op::CreateThread { .. } => "create_thread",
        Op::InsertMessage { .. } => "insert_message",
        Op::AddReference { .. } => "add_reference",
        Op::SetBlocked { .. } => "set_blocked",
    }
}

fn decode_stored_op(payload: &[u8]) -> PersistResult<StoredOp> {
    let envelope: StoredOpEnvelope = serde_json::from_slice(payload)?;
    if envelope.format_version != OP_FORMAT_VERSION {
        return Err(PersistError::Message(format!(
            "unsupported op format {}",
            envelope.format_version
        )));
    }
    Ok(envelope.stored)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
