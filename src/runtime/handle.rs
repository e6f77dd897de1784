use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::{
        Mutex, broadcast,
        mpsc::{self, OwnedPermit},
        oneshot,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    changeset::{ChangeSet, PnpOperation},
    conversation::{MessageDraft, MessageRecord},
    core::{
        error::{ResolveError, StoreError},
        refs::RefDraft,
        store::{RecipientStore, ResolveOutcome, StoreSnapshotV1},
    },
    op::{Op, StoredOp},
    oracle::LocalIdentity,
    persist::{OpSink, PersistError},
    recipient::{RecipientRecord, ResolveRequest},
    types::{Aci, MessageId, OpSeq, RecipientId, RowId, ThreadId},
};

use super::events::RecipientEvent;

/// Failure of a runtime call.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Resolution was rejected; the store is unchanged.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// A direct mutation was rejected.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The journal could not keep up or failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime task has stopped.
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Tuning knobs for the writer loop and its persistence worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flush the journal right after every resolution that changed state.
    pub flush_each_resolve: bool,
    /// Flush once this many ops are buffered.
    pub batch_max_ops: usize,
    /// Flush buffered ops after this long.
    pub batch_max_latency_ms: u64,
    /// Capacity of the queue feeding the persistence worker.
    pub persist_queue_bound: usize,
    /// Write a snapshot every this many ops; 0 disables.
    pub snapshot_every_ops: usize,
    /// Drop journaled ops covered by a fresh snapshot.
    pub compact_after_snapshot: bool,
    /// Identity of the account running the store.
    pub local_identity: LocalIdentity,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_each_resolve: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
            local_identity: LocalIdentity::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON config; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Cloneable handle to a running recipient store.
#[derive(Clone)]
pub struct RecipientDbHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<RecipientEvent>,
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum Command {
    Resolve {
        request: ResolveRequest,
        resp: Reply<ResolveOutcome>,
    },
    Plan {
        request: ResolveRequest,
        resp: Reply<ChangeSet>,
    },
    CreateThread {
        recipient_id: RecipientId,
        resp: Reply<ThreadId>,
    },
    InsertMessage {
        draft: MessageDraft,
        resp: Reply<MessageId>,
    },
    AddReference {
        draft: RefDraft,
        resp: Reply<RowId>,
    },
    SetBlocked {
        id: RecipientId,
        blocked: bool,
        resp: Reply<()>,
    },
    SetLocalIdentity {
        identity: LocalIdentity,
        resp: oneshot::Sender<()>,
    },
    Get {
        id: RecipientId,
        resp: oneshot::Sender<Option<RecipientRecord>>,
    },
    ByE164 {
        e164: String,
        resp: oneshot::Sender<Option<RecipientRecord>>,
    },
    ByAci {
        aci: Aci,
        resp: oneshot::Sender<Option<RecipientRecord>>,
    },
    Remapped {
        id: RecipientId,
        resp: oneshot::Sender<Option<RecipientId>>,
    },
    ThreadMessages {
        thread_id: ThreadId,
        resp: oneshot::Sender<Vec<MessageRecord>>,
    },
    Flush {
        resp: Reply<OpSeq>,
    },
    Checkpoint {
        resp: Reply<()>,
    },
    Shutdown {
        resp: Reply<()>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

struct Writer {
    store: RecipientStore,
    local: LocalIdentity,
    events_tx: broadcast::Sender<RecipientEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    ops_since_snapshot: usize,
}

/// Starts the single-writer loop over `store`.
///
/// Every mutation runs on one task, so a resolution's match, plan and apply
/// never interleave with another. Journaled ops go to `sink` in the background.
pub fn spawn_recipientdb(
    store: RecipientStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> RecipientDbHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<RecipientEvent>(1024);

    let (persist_tx, mut durable_rx) = match sink {
        Some(sink) => {
            let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
            let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
            spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
            (Some(persist_tx), Some(durable_rx))
        }
        None => (None, None),
    };

    let mut writer = Writer {
        store,
        local: config.local_identity.clone(),
        events_tx: events_tx.clone(),
        persist_tx,
        config,
        ops_since_snapshot: 0,
    };

    tokio::spawn(async move {
        info!(recipients = writer.store.len(), "recipient runtime started");
        loop {
            let cmd = match durable_rx.as_mut() {
                Some(rx) => tokio::select! {
                    cmd = cmd_rx.recv() => cmd,
                    durable = rx.recv() => {
                        match durable {
                            Some(Ok(op_seq)) => {
                                let _ = writer.events_tx.send(RecipientEvent::DurableUpTo { op_seq });
                            }
                            Some(Err(err)) => error!(%err, "journal append failed"),
                            None => {}
                        }
                        continue;
                    }
                },
                None => cmd_rx.recv().await,
            };

            let Some(cmd) = cmd else { break };
            if writer.handle(cmd).await {
                break;
            }
        }
        info!("recipient runtime stopped");
    });

    RecipientDbHandle { cmd_tx, events_tx }
}

impl RecipientDbHandle {
    /// Subscribes to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RecipientEvent> {
        self.events_tx.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Resolves a tuple to a recipient id, creating or merging records as needed.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<RecipientId, RuntimeError> {
        self.resolve_with_report(request).await.map(|outcome| outcome.id)
    }

    /// Like [`Self::resolve`], returning everything the resolution did.
    pub async fn resolve_with_report(&self, request: ResolveRequest) -> Result<ResolveOutcome, RuntimeError> {
        self.call(|resp| Command::Resolve { request, resp }).await?
    }

    /// Plans a resolution against current state without applying it.
    pub async fn plan(&self, request: ResolveRequest) -> Result<ChangeSet, RuntimeError> {
        self.call(|resp| Command::Plan { request, resp }).await?
    }

    /// Opens the thread with `recipient_id`.
    pub async fn create_thread(&self, recipient_id: RecipientId) -> Result<ThreadId, RuntimeError> {
        self.call(|resp| Command::CreateThread { recipient_id, resp })
            .await?
    }

    /// Appends a message.
    pub async fn insert_message(&self, draft: MessageDraft) -> Result<MessageId, RuntimeError> {
        self.call(|resp| Command::InsertMessage { draft, resp }).await?
    }

    /// Adds a dependent row.
    pub async fn add_reference(&self, draft: RefDraft) -> Result<RowId, RuntimeError> {
        self.call(|resp| Command::AddReference { draft, resp }).await?
    }

    /// Blocks or unblocks a recipient.
    pub async fn set_blocked(&self, id: RecipientId, blocked: bool) -> Result<(), RuntimeError> {
        self.call(|resp| Command::SetBlocked { id, blocked, resp })
            .await?
    }

    /// Replaces the local account identity used by later resolutions.
    pub async fn set_local_identity(&self, identity: LocalIdentity) -> Result<(), RuntimeError> {
        self.call(|resp| Command::SetLocalIdentity { identity, resp })
            .await
    }

    /// Record by id.
    pub async fn get(&self, id: RecipientId) -> Result<Option<RecipientRecord>, RuntimeError> {
        self.call(|resp| Command::Get { id, resp }).await
    }

    /// Record holding `e164`.
    pub async fn by_e164(&self, e164: impl Into<String>) -> Result<Option<RecipientRecord>, RuntimeError> {
        let e164 = e164.into();
        self.call(|resp| Command::ByE164 { e164, resp }).await
    }

    /// Record holding `aci`.
    pub async fn by_aci(&self, aci: Aci) -> Result<Option<RecipientRecord>, RuntimeError> {
        self.call(|resp| Command::ByAci { aci, resp }).await
    }

    /// Live id that now stands for `id`, following merges.
    pub async fn remapped(&self, id: RecipientId) -> Result<Option<RecipientId>, RuntimeError> {
        self.call(|resp| Command::Remapped { id, resp }).await
    }

    /// Messages of a thread in send order.
    pub async fn thread_messages(&self, thread_id: ThreadId) -> Result<Vec<MessageRecord>, RuntimeError> {
        self.call(|resp| Command::ThreadMessages { thread_id, resp })
            .await
    }

    /// Waits until every op issued so far is durable.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        self.call(|resp| Command::Flush { resp }).await?
    }

    /// Writes a snapshot of the current state.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        self.call(|resp| Command::Checkpoint { resp }).await?
    }

    /// Flushes and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.call(|resp| Command::Shutdown { resp }).await?
    }
}

impl Writer {
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Resolve { request, resp } => {
                let res = self.resolve(&request).await;
                if let Err(err) = &res {
                    debug!(%err, "resolve rejected");
                }
                let _ = resp.send(res);
                self.maybe_auto_checkpoint().await;
            }
            Command::Plan { request, resp } => {
                let sessions = self.store.session_oracle();
                let res = self
                    .store
                    .plan(&request, &sessions, &self.local)
                    .map_err(RuntimeError::from);
                let _ = resp.send(res);
            }
            Command::CreateThread { recipient_id, resp } => {
                let _ = resp.send(self.create_thread(recipient_id).await);
                self.maybe_auto_checkpoint().await;
            }
            Command::InsertMessage { draft, resp } => {
                let res = match self.reserve_journal_slot() {
                    Ok(permit) => match self.store.insert_message(draft) {
                        Ok((id, _)) => {
                            self.journal(permit).await;
                            Ok(id)
                        }
                        Err(err) => Err(err.into()),
                    },
                    Err(err) => Err(err),
                };
                let _ = resp.send(res);
                self.maybe_auto_checkpoint().await;
            }
            Command::AddReference { draft, resp } => {
                let res = match self.reserve_journal_slot() {
                    Ok(permit) => match self.store.add_reference(draft) {
                        Ok((id, _)) => {
                            self.journal(permit).await;
                            Ok(id)
                        }
                        Err(err) => Err(err.into()),
                    },
                    Err(err) => Err(err),
                };
                let _ = resp.send(res);
                self.maybe_auto_checkpoint().await;
            }
            Command::SetBlocked { id, blocked, resp } => {
                let _ = resp.send(self.set_blocked(id, blocked).await);
                self.maybe_auto_checkpoint().await;
            }
            Command::SetLocalIdentity { identity, resp } => {
                info!(e164 = ?identity.e164, aci = ?identity.aci, "local identity updated");
                self.local = identity;
                let _ = resp.send(());
            }
            Command::Get { id, resp } => {
                let _ = resp.send(self.store.get_cloned(id));
            }
            Command::ByE164 { e164, resp } => {
                let _ = resp.send(self.store.by_e164(&e164).cloned());
            }
            Command::ByAci { aci, resp } => {
                let _ = resp.send(self.store.by_aci(aci).cloned());
            }
            Command::Remapped { id, resp } => {
                let _ = resp.send(self.store.remapped(id));
            }
            Command::ThreadMessages { thread_id, resp } => {
                let _ = resp.send(self.store.thread_messages_cloned(thread_id));
            }
            Command::Flush { resp } => {
                let out = match &self.persist_tx {
                    Some(tx) => {
                        let (flush_tx, flush_rx) = oneshot::channel();
                        match tx.send(PersistMsg::Flush { resp: flush_tx }).await {
                            Err(_) => Err(RuntimeError::ChannelClosed),
                            Ok(()) => flush_rx
                                .await
                                .map_err(|_| RuntimeError::ChannelClosed)
                                .and_then(|r| r.map_err(RuntimeError::from)),
                        }
                    }
                    None => Ok(self.store.latest_op_seq()),
                };
                let _ = resp.send(out);
            }
            Command::Checkpoint { resp } => {
                let _ = resp.send(self.checkpoint().await);
            }
            Command::Shutdown { resp } => {
                let out = match &self.persist_tx {
                    Some(tx) => {
                        let (done_tx, done_rx) = oneshot::channel();
                        match tx.send(PersistMsg::Shutdown { resp: done_tx }).await {
                            Err(_) => Err(RuntimeError::ChannelClosed),
                            Ok(()) => done_rx.await.map_err(|_| RuntimeError::ChannelClosed),
                        }
                    }
                    None => Ok(()),
                };
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    async fn resolve(&mut self, request: &ResolveRequest) -> Result<ResolveOutcome, RuntimeError> {
        let permit = match self.reserve_journal_slot() {
            Ok(permit) => permit,
            Err(err) => {
                // A full queue only refuses resolutions that would change state.
                let sessions = self.store.session_oracle();
                if !self.store.plan(request, &sessions, &self.local)?.is_noop() {
                    return Err(err);
                }
                None
            }
        };
        let outcome = self.store.resolve_with_own_sessions(request, &self.local)?;
        self.journal(permit).await;
        self.publish_outcome(&outcome);
        Ok(outcome)
    }

    async fn create_thread(&mut self, recipient_id: RecipientId) -> Result<ThreadId, RuntimeError> {
        let permit = self.reserve_journal_slot()?;
        let (thread_id, _) = self.store.create_thread(recipient_id)?;
        self.journal(permit).await;
        let _ = self.events_tx.send(RecipientEvent::ThreadCreated {
            thread_id,
            recipient_id,
        });
        Ok(thread_id)
    }

    async fn set_blocked(&mut self, id: RecipientId, blocked: bool) -> Result<(), RuntimeError> {
        let permit = self.reserve_journal_slot()?;
        self.store.set_blocked(id, blocked)?;
        self.journal(permit).await;
        let _ = self.events_tx.send(RecipientEvent::BlockedChanged { id, blocked });
        Ok(())
    }

    /// Claims queue room for the op of the next mutation, before the store is touched.
    fn reserve_journal_slot(&self) -> Result<Option<OwnedPermit<PersistMsg>>, RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(None);
        };
        match tx.clone().try_reserve_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(err) => {
                warn!(%err, "persist queue full, mutation refused");
                Err(PersistError::Message(format!("persist queue error: {err}")).into())
            }
        }
    }

    /// Hands the ops of the last mutation to the persistence worker.
    ///
    /// Every mutation journals at most one op, which travels on `permit`.
    async fn journal(&mut self, mut permit: Option<OwnedPermit<PersistMsg>>) {
        let ops = self.store.drain_pending_ops();
        if ops.is_empty() {
            return;
        }
        self.ops_since_snapshot += ops.len();

        let Some(tx) = &self.persist_tx else {
            let _ = self.events_tx.send(RecipientEvent::DurableUpTo {
                op_seq: self.store.latest_op_seq(),
            });
            return;
        };
        for stored in ops {
            let sent = match permit.take() {
                Some(permit) => {
                    permit.send(PersistMsg::Op(stored));
                    Ok(())
                }
                None => tx.send(PersistMsg::Op(stored)).await.map_err(|_| ()),
            };
            if sent.is_err() {
                error!("persistence worker gone, op not journaled");
            }
        }
    }

    fn publish_outcome(&self, outcome: &ResolveOutcome) {
        if outcome.inserted {
            let _ = self.events_tx.send(RecipientEvent::Inserted { id: outcome.id });
        }
        for op in &outcome.operations {
            let event = match op {
                PnpOperation::Merge { primary, secondary } => RecipientEvent::Merged {
                    primary: *primary,
                    secondary: *secondary,
                },
                PnpOperation::ChangeNumberNotice { id, .. } => RecipientEvent::NumberChanged { id: *id },
                PnpOperation::SessionSwitchoverNotice { id, .. } => {
                    RecipientEvent::SessionSwitchover { id: *id }
                }
                _ => continue,
            };
            let _ = self.events_tx.send(event);
        }
        for id in &outcome.affected {
            let _ = self.events_tx.send(RecipientEvent::Updated { id: *id });
        }
    }

    async fn checkpoint(&mut self) -> Result<(), RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let (cp_tx, cp_rx) = oneshot::channel();
        tx.send(PersistMsg::Checkpoint {
            snapshot: self.store.export_snapshot(),
            last_seq: self.store.latest_op_seq(),
            compact: self.config.compact_after_snapshot,
            resp: cp_tx,
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        cp_rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
        self.ops_since_snapshot = 0;
        Ok(())
    }

    async fn maybe_auto_checkpoint(&mut self) {
        if self.config.snapshot_every_ops == 0 || self.ops_since_snapshot < self.config.snapshot_every_ops {
            return;
        }
        if let Err(err) = self.checkpoint().await {
            warn!(%err, "automatic checkpoint failed");
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    let latency = Duration::from_millis(config.batch_max_latency_ms);
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let mut deadline = Instant::now() + latency;
        let mut last_durable: OpSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let urgent = config.flush_each_resolve && matches!(stored.op, Op::Resolve { .. });
                            buf.push(stored);

                            if buf.len() >= config.batch_max_ops || urgent {
                                let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                                deadline = Instant::now() + latency;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let result = match flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await {
                                Err(err) => Err(err),
                                Ok(()) => {
                                    let sink_ref = Arc::clone(&sink);
                                    tokio::task::spawn_blocking(move || {
                                        let mut sink = sink_ref.blocking_lock();
                                        sink.write_snapshot(&snapshot, last_seq)?;
                                        if compact {
                                            sink.compact_through(last_seq)?;
                                        }
                                        Result::<(), PersistError>::Ok(())
                                    })
                                    .await
                                    .unwrap_or_else(|e| Err(PersistError::Message(format!("join error: {e}"))))
                                }
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, false).await;
                    deadline = Instant::now() + latency;
                }
            }
        }
    });
}

async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    last_durable: &mut OpSeq,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if buf.is_empty() && !call_flush {
        return Ok(());
    }

    let ops = std::mem::take(buf);
    let count = ops.len();
    let sink_ref = Arc::clone(sink);
    let append_res: Result<OpSeq, PersistError> = tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        let seq = if ops.is_empty() { 0 } else { sink.append_ops(&ops)? };
        if call_flush {
            sink.flush()?;
        }
        Ok(seq)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(seq) => {
            if count > 0 {
                *last_durable = (*last_durable).max(seq);
                debug!(count, durable = *last_durable, "journal batch written");
                let _ = durable_tx.send(Ok(*last_durable));
            }
            Ok(())
        }
        Err(err) => {
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}
