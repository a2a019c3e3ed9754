//! Session actor: one task owns the [`Reconciler`].
//!
//! UI commands, decoded stream batches, RPC completions and the timeout tick
//! all arrive on channels and are handled one at a time, so the merged view
//! has a single writer. RPC calls run as spawned tasks; their answers come
//! back as completions, which lets the stream keep advancing the baseline
//! while a call is outstanding.
//!
//! ```text
//!   SessionHandle (Clone)     mpsc       Session task
//!   ┌───────────────────┐  ─────────▶  ┌─────────────────────────────┐
//!   │ .create()         │              │ Reconciler                  │◀── StreamItem (subscriber)
//!   │ .toggle()         │  ◀─────────  │ spawn RPC ──▶ Completion    │◀── Completion (RPC tasks)
//!   │ .snapshot()       │   oneshot    │ tick ──▶ check_timeouts     │
//!   └───────────────────┘              └─────────────────────────────┘
//!            ▲                                    │
//!            └──────── broadcast<SessionEvent> ◀──┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{Instrument, debug, info_span, warn};

use todolog_types::{Item, ItemChanges, ItemId, NewItem, ValidationError, Watermark};

use crate::config::ClientConfig;
use crate::constants::{EVENT_CHANNEL_CAPACITY, STREAM_QUEUE_CAPACITY, TIMEOUT_TICK};
use crate::pending::{Mutation, MutationId};
use crate::reconciler::{Reconciler, SessionEvent, SyncStatus};
use crate::rpc::{self, MutationClient};
use crate::shape::{ShapeSubscriber, StreamItem};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("mutation {id} failed: {reason}")]
    Failed { id: MutationId, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session shut down")]
    Shutdown,
}

/// The merged view at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub version: u64,
    pub status: SyncStatus,
    /// The first replay has completed.
    pub synced: bool,
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum Command {
    Submit {
        mutation: Mutation,
        reply: oneshot::Sender<Result<MutationId, ValidationError>>,
    },
    Discard {
        id: MutationId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
}

/// An RPC call came back.
#[derive(Debug)]
enum Completion {
    Committed { id: MutationId, txid: Option<Watermark> },
    Failed { id: MutationId, reason: String },
}

// ============================================================================
// SessionHandle (public API)
// ============================================================================

/// Cloneable handle to a running session.
///
/// Mutation methods return as soon as the overlay is applied; outcomes arrive
/// on [`subscribe_events`](Self::subscribe_events).
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    version: watch::Receiver<u64>,
}

impl SessionHandle {
    pub async fn create(&self, item: NewItem) -> Result<MutationId, SessionError> {
        self.submit(Mutation::Create(item)).await
    }

    pub async fn update(&self, id: ItemId, changes: ItemChanges) -> Result<MutationId, SessionError> {
        self.submit(Mutation::Update { id, changes }).await
    }

    pub async fn toggle(&self, id: ItemId) -> Result<MutationId, SessionError> {
        self.submit(Mutation::Toggle { id }).await
    }

    pub async fn delete(&self, ids: Vec<ItemId>) -> Result<MutationId, SessionError> {
        self.submit(Mutation::Delete { ids }).await
    }

    pub async fn clear_completed(&self) -> Result<MutationId, SessionError> {
        self.submit(Mutation::ClearCompleted).await
    }

    /// Apply a mutation optimistically and start its RPC call.
    pub async fn submit(&self, mutation: Mutation) -> Result<MutationId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { mutation, reply })
            .map_err(|_| SessionError::Shutdown)?;
        Ok(rx.await.map_err(|_| SessionError::Shutdown)??)
    }

    /// Stop waiting on a mutation. It keeps running and is still reconciled.
    pub async fn discard(&self, id: MutationId) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Discard { id, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn status(&self) -> Result<SyncStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Changes whenever the merged view does, including writes from other
    /// clients arriving on the stream.
    pub fn subscribe_version(&self) -> watch::Receiver<u64> {
        self.version.clone()
    }

    /// Wait until the first replay of the log has been applied.
    pub async fn wait_synced(&self) -> Result<Snapshot, SessionError> {
        let mut events = self.subscribe_events();
        loop {
            let snapshot = self.snapshot().await?;
            if snapshot.synced {
                return Ok(snapshot);
            }
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Resynced { .. }) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(SessionError::Shutdown),
                }
            }
        }
    }

    /// Submit a mutation and wait until it is reconciled (or committed
    /// nothing). Returns the terminal event.
    pub async fn submit_and_settle(&self, mutation: Mutation) -> Result<SessionEvent, SessionError> {
        let mut events = self.subscribe_events();
        let id = self.submit(mutation).await?;
        wait_settled(&mut events, id).await
    }
}

/// Wait on `events` for the terminal event of `id`. The receiver must have
/// been subscribed before the mutation was submitted.
pub async fn wait_settled(
    events: &mut broadcast::Receiver<SessionEvent>,
    id: MutationId,
) -> Result<SessionEvent, SessionError> {
    loop {
        match events.recv().await {
            Ok(event) if event.mutation_id() == Some(id) && event.is_terminal() => {
                return match event {
                    SessionEvent::Failed { id, reason } => Err(SessionError::Failed { id, reason }),
                    event => Ok(event),
                };
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(SessionError::Shutdown),
        }
    }
}

// ============================================================================
// Session task (internal)
// ============================================================================

struct Session<C: MutationClient> {
    reconciler: Reconciler,
    client: Arc<C>,
    config: ClientConfig,
    events: broadcast::Sender<SessionEvent>,
    version: watch::Sender<u64>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl<C: MutationClient> Session<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut stream: mpsc::Receiver<StreamItem>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut tick = tokio::time::interval(TIMEOUT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(item) = stream.recv() => self.handle_stream(item),
                Some(completion) = completions.recv() => self.handle_completion(completion),
                _ = tick.tick() => {
                    let events = self.reconciler.check_timeouts(Instant::now());
                    self.publish(events);
                }
            }

            let version = self.reconciler.version();
            self.version.send_if_modified(|v| std::mem::replace(v, version) != version);
        }
        debug!("session shutting down: all handles dropped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { mutation, reply } => {
                let result = self.reconciler.apply_optimistic(mutation.clone(), Instant::now());
                if let Ok(id) = result {
                    self.spawn_call(id, mutation);
                }
                let _ = reply.send(result);
            }
            Command::Discard { id, reply } => {
                let _ = reply.send(self.reconciler.detach(&id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Snapshot {
                    items: self.reconciler.view(),
                    version: self.reconciler.version(),
                    status: self.reconciler.status(),
                    synced: self.reconciler.is_synced(),
                });
            }
            Command::Status { reply } => {
                let _ = reply.send(self.reconciler.status());
            }
        }
    }

    fn handle_stream(&mut self, item: StreamItem) {
        match item {
            StreamItem::Reset => self.reconciler.begin_resync(),
            StreamItem::Messages(messages) => {
                for message in &messages {
                    let events = self.reconciler.on_stream_event(message);
                    self.publish(events);
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Committed { id, txid } => {
                let events = self.reconciler.mark_committed(id, txid, Instant::now());
                self.publish(events);
            }
            Completion::Failed { id, reason } => {
                let event = self.reconciler.mark_failed(id, reason);
                self.publish(event);
            }
        }
    }

    /// Run the executor call off-task; the answer comes back as a completion.
    fn spawn_call(&self, id: MutationId, mutation: Mutation) {
        let client = Arc::clone(&self.client);
        let completions = self.completions.clone();
        let timeout = self.config.commit_timeout;
        let span = info_span!("session.mutation", mutation = %id, kind = mutation.kind());

        tokio::spawn(
            async move {
                let completion = match tokio::time::timeout(timeout, rpc::execute(&*client, &mutation)).await {
                    Ok(Ok(txid)) => Completion::Committed { id, txid },
                    Ok(Err(e)) => Completion::Failed { id, reason: e.to_string() },
                    Err(_) => Completion::Failed { id, reason: "commit timed out".to_string() },
                };
                let _ = completions.send(completion);
            }
            .instrument(span),
        );
    }

    fn publish(&self, events: impl IntoIterator<Item = SessionEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

// ============================================================================
// Public spawn functions
// ============================================================================

/// Start a session against `config.shape_url()` with the given executor.
pub fn spawn_session<C: MutationClient>(config: ClientConfig, client: Arc<C>) -> Result<SessionHandle, SessionError> {
    let http = reqwest::Client::builder().build()?;
    let (stream_tx, stream_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    ShapeSubscriber::new(http, config.shape_url(), config.resubscribe_delay, stream_tx).spawn();
    Ok(spawn_session_with_feed(config, client, stream_rx))
}

/// Start a session fed by an external stream source.
pub fn spawn_session_with_feed<C: MutationClient>(
    config: ClientConfig,
    client: Arc<C>,
    feed: mpsc::Receiver<StreamItem>,
) -> SessionHandle {
    let (tx, commands) = mpsc::unbounded_channel();
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (version_tx, version) = watch::channel(0);

    let session = Session {
        reconciler: Reconciler::from_config(&config),
        client,
        config,
        events: events.clone(),
        version: version_tx,
        completions: completions_tx,
    };
    tokio::spawn(session.run(commands, feed, completions));

    SessionHandle { tx, events, version }
}
