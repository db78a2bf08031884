//! Durable, process-wide outbound message queue.
//!
//! The queue is a single actor task that owns every [`PendingMessage`] not
//! yet accepted by the remote store. Callers reach it through a cloneable
//! [`OutboundQueueHandle`]:
//!
//! ```text
//! handle ── QueueCommand ──▶ actor ── send_message ──▶ RemoteStore
//!    ▲                         │
//!    └──── QueueEvent ◀────────┘ (one unbounded channel per subscriber)
//! ```
//!
//! Entries are sent strictly in enqueue order, one at a time. A retryable
//! failure blocks the head and schedules a retry with capped exponential
//! backoff; a terminal failure drops the entry and the flush continues.

pub mod actor;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use chatsync_proto::message::{ConversationId, Message, MessageId, PendingMessage};

use crate::cache::LocalCacheStore;
use crate::config::SyncConfig;
use crate::remote::{Connectivity, RemoteError, RemoteStore};
use crate::store::{KeyValueStore, StoreError};

use actor::{QueueActor, QueueCommand};

/// Key under which the queue is persisted.
pub const QUEUE_KEY: &str = "offline_queue";

/// Errors returned by [`OutboundQueueHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue actor has stopped.
    #[error("outbound queue is shut down")]
    Closed,

    /// The persisted queue could not be restored.
    #[error("failed to restore outbound queue: {0}")]
    Restore(#[from] StoreError),
}

/// Progress of queued sends, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The remote store accepted a message.
    Confirmed {
        /// Id the message was queued under.
        temporary_id: MessageId,
        /// The message as stored remotely, with its confirmed id.
        message: Message,
    },
    /// A send failed transiently and will be retried.
    Retrying {
        /// Temporary id of the message.
        id: MessageId,
        /// Attempts made so far.
        attempt: u32,
        /// Delay before the automatic retry.
        retry_in: Duration,
    },
    /// A send failed permanently; the entry left the queue.
    Failed {
        /// Temporary id of the message.
        id: MessageId,
        /// Conversation of the message.
        conversation: ConversationId,
        /// Why the remote rejected it.
        error: RemoteError,
    },
}

impl QueueEvent {
    /// Temporary id the event refers to.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        match self {
            Self::Confirmed { temporary_id, .. } => temporary_id,
            Self::Retrying { id, .. } | Self::Failed { id, .. } => id,
        }
    }
}

/// Fan-out of [`QueueEvent`]s to subscribers.
///
/// Each subscriber owns an unbounded channel, so a slow reader falls behind
/// but never misses an event. `None` once the actor has stopped.
#[derive(Debug, Clone)]
pub(crate) struct Subscribers(Arc<Mutex<Option<Vec<mpsc::UnboundedSender<QueueEvent>>>>>);

impl Subscribers {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Some(Vec::new()))))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // After close the sender is dropped here and the receiver ends at once.
        if let Some(list) = self.0.lock().as_mut() {
            list.push(tx);
        }
        rx
    }

    /// Delivers `event` to every live subscriber, pruning dropped ones.
    pub(crate) fn publish(&self, event: &QueueEvent) {
        if let Some(list) = self.0.lock().as_mut() {
            list.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Ends every subscription.
    pub(crate) fn close(&self) {
        self.0.lock().take();
    }
}

/// Cloneable handle to the outbound queue actor.
#[derive(Debug, Clone)]
pub struct OutboundQueueHandle {
    commands: mpsc::Sender<QueueCommand>,
    events: Subscribers,
    depth: watch::Receiver<usize>,
}

impl OutboundQueueHandle {
    /// Restores the persisted queue and starts its actor.
    ///
    /// Confirmed sends are written through to `cache` before
    /// [`QueueEvent::Confirmed`] is published. If `connectivity` reports
    /// online and entries were restored, a flush starts immediately.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Restore`] if the persisted queue cannot be read
    /// or decoded.
    pub async fn spawn<S, R>(
        store: S,
        cache: Arc<LocalCacheStore<S>>,
        remote: Arc<R>,
        connectivity: &Connectivity,
        config: &SyncConfig,
    ) -> Result<Self, QueueError>
    where
        S: KeyValueStore + 'static,
        R: RemoteStore + 'static,
    {
        let entries = actor::restore(&store).await?;
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let events = Subscribers::new();
        let (depth_tx, depth_rx) = watch::channel(entries.len());

        tracing::info!(restored = entries.len(), "outbound queue started");

        let actor = QueueActor::new(
            store,
            cache,
            remote,
            entries,
            commands_rx,
            connectivity.subscribe(),
            events.clone(),
            depth_tx,
            config,
        );
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            events,
            depth: depth_rx,
        })
    }

    /// Appends a message. Returns `false` if its id is already queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn enqueue(&self, pending: PendingMessage) -> Result<bool, QueueError> {
        self.request(|reply| QueueCommand::Enqueue { pending, reply })
            .await
    }

    /// Every queued entry in enqueue order. Entries stay queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn dequeue_all(&self) -> Result<Vec<PendingMessage>, QueueError> {
        self.request(|reply| QueueCommand::Snapshot { reply }).await
    }

    /// Drops a queued entry. Returns `true` if it was queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn remove(&self, id: &MessageId) -> Result<bool, QueueError> {
        let id = id.clone();
        self.request(|reply| QueueCommand::Remove { id, reply })
            .await
    }

    /// Asks the actor to flush now, skipping any pending backoff. Ignored
    /// while offline; absorbed while a flush is already running.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.commands
            .send(QueueCommand::Flush)
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn peek_depth(&self) -> usize {
        *self.depth.borrow()
    }

    /// Watches the queue depth.
    #[must_use]
    pub fn depth_watch(&self) -> watch::Receiver<usize> {
        self.depth.clone()
    }

    /// Subscribes to [`QueueEvent`]s published from now on.
    ///
    /// The receiver ends once the actor has stopped.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Stops the actor after the in-flight send, if any, has completed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| QueueError::Closed)?;
        reply_rx.await.map_err(|_| QueueError::Closed)
    }
}
