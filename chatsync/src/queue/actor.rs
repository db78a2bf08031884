//! The actor task behind [`OutboundQueueHandle`](super::OutboundQueueHandle).
//!
//! The actor owns the queue contents and is the only writer of the
//! persisted `offline_queue` key. The send itself runs in a spawned task
//! that reports a [`SendOutcome`] back, so commands (enqueue, depth,
//! remove) are served while a send is in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use chatsync_proto::codec;
use chatsync_proto::message::{ConversationId, Message, MessageId, PendingMessage};

use crate::cache::LocalCacheStore;
use crate::config::SyncConfig;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{KeyValueStore, StoreError};

use super::{QUEUE_KEY, QueueEvent, Subscribers};

/// Requests from handles to the actor.
#[derive(Debug)]
pub(crate) enum QueueCommand {
    Enqueue {
        pending: PendingMessage,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PendingMessage>>,
    },
    Remove {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Flush,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of one send attempt, reported by the send task.
#[derive(Debug)]
struct SendOutcome {
    id: MessageId,
    conversation: ConversationId,
    result: Result<Message, RemoteError>,
}

/// Delay before retry number `attempt`: `base * 2^(attempt-1)`, capped at
/// `max`. Attempt 0 means no delay.
#[must_use]
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier).min(max)
}

/// Reads the persisted queue, in original order.
pub(crate) async fn restore<S: KeyValueStore>(
    store: &S,
) -> Result<VecDeque<PendingMessage>, StoreError> {
    match store.get(QUEUE_KEY).await? {
        Some(bytes) => codec::decode(&bytes).map_err(|source| StoreError::Corrupt {
            key: QUEUE_KEY.to_string(),
            source,
        }),
        None => Ok(VecDeque::new()),
    }
}

pub(crate) struct QueueActor<S: KeyValueStore, R: RemoteStore> {
    store: S,
    cache: Arc<LocalCacheStore<S>>,
    remote: Arc<R>,
    entries: VecDeque<PendingMessage>,
    /// Id of the entry whose send task is running.
    in_flight: Option<MessageId>,
    /// When the head may be retried after a transient failure.
    retry_at: Option<Instant>,
    online: bool,
    stopping: bool,
    commands: mpsc::Receiver<QueueCommand>,
    connectivity: watch::Receiver<bool>,
    outcome_tx: mpsc::Sender<SendOutcome>,
    outcome_rx: mpsc::Receiver<SendOutcome>,
    events: Subscribers,
    depth: watch::Sender<usize>,
    send_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<S, R> QueueActor<S, R>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: S,
        cache: Arc<LocalCacheStore<S>>,
        remote: Arc<R>,
        entries: VecDeque<PendingMessage>,
        commands: mpsc::Receiver<QueueCommand>,
        connectivity: watch::Receiver<bool>,
        events: Subscribers,
        depth: watch::Sender<usize>,
        config: &SyncConfig,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        let online = *connectivity.borrow();
        Self {
            store,
            cache,
            remote,
            entries,
            in_flight: None,
            retry_at: None,
            online,
            stopping: false,
            commands,
            connectivity,
            outcome_tx,
            outcome_rx,
            events,
            depth,
            send_timeout: config.send_timeout,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start_next();
        let mut connectivity_open = true;

        loop {
            let retry_deadline = self.retry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(QueueCommand::Shutdown { reply }) => {
                            self.drain_in_flight().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.drain_in_flight().await;
                            break;
                        }
                    }
                }
                changed = self.connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    let online = *self.connectivity.borrow_and_update();
                    let came_online = online && !self.online;
                    self.online = online;
                    tracing::debug!(online, depth = self.entries.len(), "connectivity changed");
                    if came_online {
                        self.request_flush();
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
                () = tokio::time::sleep_until(retry_deadline), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.start_next();
                }
            }
        }

        self.events.close();
        tracing::info!(remaining = self.entries.len(), "outbound queue stopped");
    }

    async fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Enqueue { pending, reply } => {
                let added = self.enqueue(pending).await;
                let _ = reply.send(added);
                if added && self.retry_at.is_none() {
                    self.start_next();
                }
            }
            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(self.entries.iter().cloned().collect());
            }
            QueueCommand::Remove { id, reply } => {
                let removed = self.remove(&id).await;
                let _ = reply.send(removed);
            }
            QueueCommand::Flush => self.request_flush(),
            // Handled by the run loop.
            QueueCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn enqueue(&mut self, pending: PendingMessage) -> bool {
        if self.entries.iter().any(|e| e.id() == pending.id()) {
            tracing::debug!(message_id = %pending.id(), "already queued, ignoring");
            return false;
        }
        tracing::debug!(
            message_id = %pending.id(),
            conversation = %pending.conversation_id(),
            "queued outbound message"
        );
        self.entries.push_back(pending);
        self.persist().await;
        true
    }

    async fn remove(&mut self, id: &MessageId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id() == id) else {
            return false;
        };
        self.entries.remove(pos);
        if pos == 0 {
            self.retry_at = None;
        }
        self.persist().await;
        tracing::debug!(message_id = %id, "removed from outbound queue");
        if self.in_flight.is_none() {
            self.start_next();
        }
        true
    }

    /// Starts a flush unless one is running or the queue is offline.
    fn request_flush(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        self.retry_at = None;
        self.start_next();
    }

    /// Spawns the send task for the head entry, if allowed.
    fn start_next(&mut self) {
        if self.stopping || self.in_flight.is_some() || self.retry_at.is_some() || !self.online {
            return;
        }
        let Some(head) = self.entries.front() else {
            return;
        };

        let pending = head.clone();
        self.in_flight = Some(pending.id().clone());
        let remote = Arc::clone(&self.remote);
        let outcome_tx = self.outcome_tx.clone();
        let send_timeout = self.send_timeout;

        tracing::debug!(
            message_id = %pending.id(),
            attempt = pending.attempt,
            "sending queued message"
        );

        tokio::spawn(async move {
            let message = &pending.message;
            let send = remote.send_message(
                &message.conversation_id,
                &message.sender_id,
                &message.content,
            );
            let result = tokio::time::timeout(send_timeout, send)
                .await
                .unwrap_or(Err(RemoteError::Timeout))
                .and_then(|stored| {
                    // A confirmed id must never look like one minted locally.
                    if stored.id.is_temporary() {
                        Err(RemoteError::Malformed(format!(
                            "confirmed id {} uses the temporary prefix",
                            stored.id
                        )))
                    } else {
                        Ok(stored)
                    }
                });
            let outcome = SendOutcome {
                id: message.id.clone(),
                conversation: message.conversation_id.clone(),
                result,
            };
            let _ = outcome_tx.send(outcome).await;
        });
    }

    async fn handle_outcome(&mut self, outcome: SendOutcome) {
        self.in_flight = None;
        let SendOutcome {
            id,
            conversation,
            result,
        } = outcome;
        let position = self.entries.iter().position(|e| e.id() == &id);

        match result {
            Ok(message) => {
                if let Some(pos) = position {
                    self.entries.remove(pos);
                    self.persist().await;
                }
                self.cache.resolve(&conversation, &id, message.clone()).await;
                tracing::info!(
                    temporary_id = %id,
                    confirmed_id = %message.id,
                    "queued message confirmed"
                );
                self.events.publish(&QueueEvent::Confirmed {
                    temporary_id: id,
                    message,
                });
            }
            Err(error) if error.is_retryable() => {
                let Some(pos) = position else {
                    // Removed while in flight; nothing left to retry.
                    self.start_next();
                    return;
                };
                let entry = &mut self.entries[pos];
                entry.attempt = entry.attempt.saturating_add(1);
                let attempt = entry.attempt;
                self.persist().await;

                let retry_in = compute_backoff(attempt, self.backoff_base, self.backoff_max);
                self.retry_at = Some(Instant::now() + retry_in);
                tracing::warn!(
                    message_id = %id,
                    attempt,
                    retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "send failed, will retry"
                );
                self.events.publish(&QueueEvent::Retrying {
                    id,
                    attempt,
                    retry_in,
                });
                return;
            }
            Err(error) => {
                if let Some(pos) = position {
                    self.entries.remove(pos);
                    self.persist().await;
                }
                tracing::warn!(message_id = %id, error = %error, "send rejected permanently");
                self.events.publish(&QueueEvent::Failed {
                    id,
                    conversation,
                    error,
                });
            }
        }

        self.start_next();
    }

    /// Waits for the running send, if any, so its result is not lost.
    async fn drain_in_flight(&mut self) {
        self.stopping = true;
        if self.in_flight.is_some()
            && let Some(outcome) = self.outcome_rx.recv().await
        {
            self.handle_outcome(outcome).await;
        }
    }

    async fn persist(&self) {
        self.depth.send_replace(self.entries.len());
        let result = match codec::encode(&self.entries) {
            Ok(bytes) => self.store.set(QUEUE_KEY, bytes).await,
            Err(e) => Err(StoreError::WriteFailed(e.to_string())),
        };
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                depth = self.entries.len(),
                "failed to persist outbound queue, keeping it in memory"
            );
        }
    }
}
