//! Per-conversation synchronization coordinator.
//!
//! A [`Coordinator`] keeps one conversation's ordered, deduplicated view
//! consistent across the local cache, the remote store, the live push
//! stream and the outbound queue. It publishes every change as a
//! [`SyncEvent`].
//!
//! Split across files by flow:
//! - `send.rs`: optimistic send, id resolution, retry and discard
//! - `receive.rs`: live reconciliation, refresh and read receipts
//! - [`pagination`]: loading older history

pub mod pagination;
mod receive;
mod send;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use chatsync_proto::event::LiveEvent;
use chatsync_proto::message::{
    ConversationId, DeliveryState, Message, MessageContent, MessageId, UserId, ValidationError,
};

use crate::cache::LocalCacheStore;
use crate::config::SyncConfig;
use crate::delivery::{DeliverySummary, DeliveryTracker};
use crate::lifecycle::{MessagePhase, TransitionError};
use crate::queue::{OutboundQueueHandle, QueueError, QueueEvent};
use crate::remote::{Connectivity, LiveEventSource, RemoteError, RemoteStore};
use crate::store::KeyValueStore;

use pagination::{HistoryPage, KnownHistory, PaginationCursor, PaginationError};

/// Receipts kept for messages whose confirmation has not arrived yet.
const MAX_EARLY_RECEIPTS: usize = 256;

/// Errors returned by [`Coordinator`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The content was rejected before anything was created.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The outbound queue is unavailable.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Loading older history failed.
    #[error(transparent)]
    Pagination(#[from] PaginationError),

    /// The message is not in a phase that allows the operation.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// No message with this id is in the view.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// The operation needs a temporary id.
    #[error("message {0} is already confirmed")]
    NotTemporary(MessageId),

    /// The coordinator was closed.
    #[error("conversation is closed")]
    Closed,
}

/// Why the message list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Loaded from the local cache on open.
    Cache,
    /// Merged from a remote fetch of the newest page.
    Refresh,
    /// An optimistic local send.
    LocalSend,
    /// A live push event.
    Live,
    /// A temporary id was replaced by its confirmed id.
    Resolution,
    /// Older history was prepended; callers should not auto-scroll.
    History,
    /// A failed message was discarded.
    Discard,
}

/// Notifications published by a [`Coordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The ordered message list changed.
    MessagesChanged {
        /// Full list, oldest first.
        messages: Vec<Message>,
        /// What caused the change.
        origin: ChangeOrigin,
    },
    /// A message moved to a new lifecycle phase.
    PhaseChanged {
        /// Current id of the message.
        id: MessageId,
        /// The new phase.
        phase: MessagePhase,
    },
    /// A temporary id was replaced by the remote store's id.
    IdResolved {
        /// The locally minted id.
        temporary_id: MessageId,
        /// The id issued by the remote store.
        confirmed_id: MessageId,
    },
    /// A send failed permanently.
    SendFailed {
        /// Temporary id of the message.
        id: MessageId,
        /// Why the remote rejected it.
        error: RemoteError,
    },
    /// Connectivity or the live channel went up or down.
    ConnectionChanged {
        /// Whether the client is online.
        connected: bool,
    },
    /// Number of messages waiting in the outbound queue (all conversations).
    QueueDepth(usize),
    /// Fetching the newest page failed; the cached view stays.
    RefreshFailed {
        /// The fetch error.
        error: RemoteError,
    },
    /// The cache lost its persistence and now only lives in memory.
    CacheDegraded,
}

/// Outcome of applying one live event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// A new message was inserted.
    Inserted,
    /// A known message was updated in place.
    Updated,
    /// The event carried nothing newer, or belonged elsewhere.
    Unchanged,
    /// The local user's own message, discarded.
    OwnEcho,
    /// A receipt updated a known message.
    ReceiptApplied,
    /// A receipt for a not-yet-known id was kept for later.
    ReceiptBuffered,
    /// A connectivity change was republished.
    Connectivity,
}

/// What became of a temporary id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replaced by this confirmed id.
    Confirmed(MessageId),
    /// Failed permanently for this reason.
    Failed(String),
}

/// Collaborators shared by every open conversation.
pub struct SyncContext<S: KeyValueStore, R: RemoteStore, L: LiveEventSource> {
    /// The local user.
    pub local_user: UserId,
    /// The process-wide message cache.
    pub cache: Arc<LocalCacheStore<S>>,
    /// The remote store.
    pub remote: Arc<R>,
    /// The live push source.
    pub live: Arc<L>,
    /// The process-wide outbound queue.
    pub queue: OutboundQueueHandle,
    /// Online/offline signal.
    pub connectivity: Connectivity,
    /// Tunables.
    pub config: SyncConfig,
}

impl<S: KeyValueStore, R: RemoteStore, L: LiveEventSource> Clone for SyncContext<S, R, L> {
    fn clone(&self) -> Self {
        Self {
            local_user: self.local_user.clone(),
            cache: Arc::clone(&self.cache),
            remote: Arc::clone(&self.remote),
            live: Arc::clone(&self.live),
            queue: self.queue.clone(),
            connectivity: self.connectivity.clone(),
            config: self.config.clone(),
        }
    }
}

/// Mutable view of one conversation.
#[derive(Debug, Default)]
struct ViewState {
    /// Ordered by `created_at`, unique ids.
    messages: Vec<Message>,
    /// Lifecycle of the local user's messages.
    phases: HashMap<MessageId, MessagePhase>,
    /// Temporary id → outcome.
    resolutions: HashMap<MessageId, Resolution>,
    /// Receipts that arrived before their message.
    early_receipts: VecDeque<(MessageId, UserId, DeliveryState)>,
    /// Conversation members other than the local user.
    recipients: Vec<UserId>,
}

/// State shared between the [`Coordinator`] and its background tasks.
struct Session<S: KeyValueStore, R: RemoteStore, L: LiveEventSource> {
    conversation: ConversationId,
    ctx: SyncContext<S, R, L>,
    tracker: DeliveryTracker,
    state: Mutex<ViewState>,
    cursor: Mutex<PaginationCursor>,
    events: mpsc::Sender<SyncEvent>,
    closed: watch::Sender<bool>,
    degraded_reported: AtomicBool,
}

/// Synchronizes one open conversation.
///
/// Dropping the coordinator stops its background tasks; [`close`]
/// additionally releases the live subscription.
///
/// [`close`]: Coordinator::close
pub struct Coordinator<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    session: Arc<Session<S, R, L>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S, R, L> Coordinator<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    /// Opens a conversation.
    ///
    /// Publishes the cached view immediately, marks cached temporary
    /// messages that are no longer queued as failed, starts listening to
    /// the queue and the live stream, then refreshes from the remote.
    ///
    /// Returns the coordinator and a receiver for [`SyncEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Queue`] if the outbound queue is shut down.
    pub async fn open(
        ctx: &SyncContext<S, R, L>,
        conversation: ConversationId,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>), SyncError> {
        let (events_tx, events_rx) = mpsc::channel(ctx.config.event_buffer);
        let (closed_tx, _) = watch::channel(false);

        // Subscribe before reading the queue so no confirmation slips by.
        let queue_events = ctx.queue.subscribe();
        let queued: HashMap<MessageId, u32> = ctx
            .queue
            .dequeue_all()
            .await?
            .into_iter()
            .filter(|p| p.conversation_id() == &conversation)
            .map(|p| (p.message.id, p.attempt))
            .collect();
        let cached = ctx.cache.load(&conversation).await;

        let session = Arc::new(Session {
            conversation: conversation.clone(),
            ctx: ctx.clone(),
            tracker: DeliveryTracker::new(),
            state: Mutex::new(ViewState::default()),
            cursor: Mutex::new(PaginationCursor::new(ctx.config.page_size)),
            events: events_tx,
            closed: closed_tx,
            degraded_reported: AtomicBool::new(false),
        });
        session.restore(cached, &queued).await;

        let coordinator = Self {
            tasks: parking_lot::Mutex::new(vec![
                spawn_queue_listener(Arc::downgrade(&session), queue_events),
                spawn_depth_listener(Arc::downgrade(&session), ctx.queue.depth_watch()),
                spawn_connectivity_listener(
                    Arc::downgrade(&session),
                    ctx.connectivity.subscribe(),
                ),
            ]),
            session,
        };

        match ctx.live.subscribe(&conversation).await {
            Ok(stream) => {
                let task = spawn_live_listener(Arc::downgrade(&coordinator.session), stream);
                coordinator.tasks.lock().push(task);
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation, error = %e, "live subscription failed");
                coordinator
                    .session
                    .emit(SyncEvent::ConnectionChanged { connected: false });
            }
        }

        coordinator.session.load_recipients().await;
        if let Err(e) = coordinator.refresh().await {
            tracing::debug!(conversation = %conversation, error = %e, "initial refresh failed");
        }

        tracing::info!(conversation = %conversation, "conversation opened");
        Ok((coordinator, events_rx))
    }

    /// The conversation this coordinator serves.
    #[must_use]
    pub fn conversation(&self) -> &ConversationId {
        &self.session.conversation
    }

    /// Merges the newest remote page into the view and cache.
    ///
    /// Returns how many messages were inserted or updated.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] if the fetch fails; the cached view is
    /// kept and [`SyncEvent::RefreshFailed`] is published.
    pub async fn refresh(&self) -> Result<usize, SyncError> {
        self.session.refresh().await
    }

    /// Sends text, optimistically. Returns the temporary id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for empty or oversized text.
    pub async fn send_text(&self, text: &str) -> Result<MessageId, SyncError> {
        self.send(MessageContent::Text(text.to_string())).await
    }

    /// Sends a voice clip, optimistically. Returns the temporary id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for a missing url or zero duration.
    pub async fn send_voice(
        &self,
        url: &str,
        duration_secs: u32,
        transcript: Option<String>,
    ) -> Result<MessageId, SyncError> {
        self.send(MessageContent::Voice {
            url: url.to_string(),
            duration_secs,
            transcript,
        })
        .await
    }

    /// Sends any content, optimistically. Returns the temporary id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the content is rejected, or
    /// [`SyncError::Queue`] if the outbound queue is shut down.
    pub async fn send(&self, content: MessageContent) -> Result<MessageId, SyncError> {
        self.ensure_open()?;
        self.session.send(content).await
    }

    /// Applies one live event to the view.
    pub async fn handle_live_event(&self, event: LiveEvent) -> Reconciliation {
        self.session.handle_live_event(event).await
    }

    /// Loads the next page of older history and prepends it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Pagination`] if the remote fetch fails or the
    /// coordinator is closed meanwhile.
    pub async fn load_older(&self) -> Result<HistoryPage, SyncError> {
        self.ensure_open()?;
        self.session.load_older().await
    }

    /// Marks another user's message as read by the local user.
    ///
    /// Returns `false` if it was already read.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownMessage`] if the message is not in view.
    pub async fn mark_read(&self, message_id: &MessageId) -> Result<bool, SyncError> {
        self.session.mark_read(message_id).await
    }

    /// Marks every other user's message in view as read. Returns how many
    /// changed.
    pub async fn mark_all_read(&self) -> usize {
        self.session.mark_all_read().await
    }

    /// Re-queues a failed message from its first attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transition`] if the message has not failed.
    pub async fn retry_failed(&self, temporary_id: &MessageId) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.session.retry_failed(temporary_id).await
    }

    /// Drops an unconfirmed message from queue, cache and view.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotTemporary`] for a confirmed id.
    pub async fn discard(&self, temporary_id: &MessageId) -> Result<bool, SyncError> {
        self.session.discard(temporary_id).await
    }

    /// Stops live updates and cancels pagination. Queued sends continue.
    pub async fn close(&self) {
        if self.session.closed.send_replace(true) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.session
            .ctx
            .live
            .unsubscribe(&self.session.conversation)
            .await;
        tracing::info!(conversation = %self.session.conversation, "conversation closed");
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.session.closed.borrow()
    }

    /// The current ordered view, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.session.state.lock().await.messages.clone()
    }

    /// Lifecycle phase of one of the local user's messages.
    pub async fn phase(&self, message_id: &MessageId) -> Option<MessagePhase> {
        self.session.state.lock().await.phases.get(message_id).cloned()
    }

    /// Aggregate delivery status of a message.
    #[must_use]
    pub fn delivery_summary(&self, message_id: &MessageId) -> DeliverySummary {
        self.session.tracker.status_for(message_id)
    }

    /// What became of a temporary id, if it has been resolved.
    pub async fn resolution(&self, temporary_id: &MessageId) -> Option<Resolution> {
        self.session
            .state
            .lock()
            .await
            .resolutions
            .get(temporary_id)
            .cloned()
    }

    /// Entries waiting in the outbound queue (all conversations).
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.session.ctx.queue.peek_depth()
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<S, R, L> Drop for Coordinator<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    fn drop(&mut self) {
        self.session.closed.send_replace(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl<S, R, L> Session<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    /// Seeds the view from the cache and publishes it.
    async fn restore(&self, cached: Vec<Message>, queued: &HashMap<MessageId, u32>) {
        let mut state = self.state.lock().await;
        for message in &cached {
            for (recipient, delivery) in &message.delivery_by_recipient {
                self.tracker.apply(&message.id, recipient, *delivery);
            }
            if message.sender_id != self.ctx.local_user {
                continue;
            }
            let phase = if !message.id.is_temporary() {
                own_phase(message)
            } else if let Some(attempt) = queued.get(&message.id) {
                MessagePhase::Queued { attempt: *attempt }
            } else {
                let reason = "not delivered before restart".to_string();
                tracing::warn!(message_id = %message.id, "orphaned unsent message marked failed");
                state
                    .resolutions
                    .insert(message.id.clone(), Resolution::Failed(reason.clone()));
                MessagePhase::Failed { reason }
            };
            state.phases.insert(message.id.clone(), phase);
        }
        state.messages = cached;

        let snapshot = state.messages.clone();
        let phases: Vec<_> = state
            .phases
            .iter()
            .map(|(id, phase)| (id.clone(), phase.clone()))
            .collect();
        drop(state);

        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Cache,
        });
        for (id, phase) in phases {
            self.emit(SyncEvent::PhaseChanged { id, phase });
        }
        self.note_cache_health();
    }

    /// Fetches the conversation's members and registers them as recipients
    /// of the local user's confirmed messages.
    async fn load_recipients(&self) -> Vec<UserId> {
        let members = match self.ctx.remote.participants(&self.conversation).await {
            Ok(members) => members,
            Err(e) => {
                tracing::debug!(conversation = %self.conversation, error = %e, "participant lookup failed");
                return self.state.lock().await.recipients.clone();
            }
        };
        let recipients: Vec<UserId> = members
            .into_iter()
            .filter(|m| m != &self.ctx.local_user)
            .collect();

        let mut state = self.state.lock().await;
        state.recipients.clone_from(&recipients);
        for message in &state.messages {
            if message.sender_id == self.ctx.local_user && !message.id.is_temporary() {
                self.tracker.mark_sent(&message.id, &recipients);
            }
        }
        recipients
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(conversation = %self.conversation, error = %e, "sync event dropped");
        }
    }

    /// Publishes [`SyncEvent::CacheDegraded`] the first time the cache is
    /// seen in degraded mode.
    fn note_cache_health(&self) {
        if self.ctx.cache.is_degraded() && !self.degraded_reported.swap(true, Ordering::SeqCst) {
            self.emit(SyncEvent::CacheDegraded);
        }
    }

    async fn load_older(&self) -> Result<HistoryPage, SyncError> {
        let known = {
            let state = self.state.lock().await;
            KnownHistory {
                before: state.messages.first().map(|m| m.created_at),
                ids: state.messages.iter().map(|m| m.id.clone()).collect(),
                confirmed: state
                    .messages
                    .iter()
                    .filter(|m| !m.id.is_temporary())
                    .map(|m| m.created_at)
                    .collect(),
            }
        };

        let mut cursor = self.cursor.lock().await;
        let mut closed = self.closed.subscribe();
        let page = cursor
            .load_older(
                &self.conversation,
                &self.ctx.cache,
                self.ctx.remote.as_ref(),
                &known,
                &mut closed,
            )
            .await?;
        drop(cursor);

        if page.messages.is_empty() {
            return Ok(page);
        }
        let mut state = self.state.lock().await;
        for message in &page.messages {
            if crate::timeline::position_of(&state.messages, &message.id).is_some() {
                continue;
            }
            for (recipient, delivery) in &message.delivery_by_recipient {
                self.tracker.apply(&message.id, recipient, *delivery);
            }
            if message.sender_id == self.ctx.local_user && !message.id.is_temporary() {
                self.tracker.mark_sent(&message.id, &state.recipients);
                state.phases.insert(message.id.clone(), own_phase(message));
            }
            crate::timeline::insert_chronological(&mut state.messages, message.clone());
        }
        let snapshot = state.messages.clone();
        drop(state);

        tracing::debug!(
            conversation = %self.conversation,
            count = page.messages.len(),
            source = ?page.source,
            "prepended older history"
        );
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::History,
        });
        Ok(page)
    }
}

/// Phase of a confirmed own message, derived from its delivery map.
fn own_phase(message: &Message) -> MessagePhase {
    let furthest = message
        .delivery_by_recipient
        .values()
        .max()
        .copied()
        .unwrap_or(DeliveryState::Sent);
    MessagePhase::from_delivery(furthest)
}

fn spawn_queue_listener<S, R, L>(
    session: Weak<Session<S, R, L>>,
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
) -> JoinHandle<()>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.apply_queue_event(event).await;
        }
    })
}

fn spawn_live_listener<S, R, L>(
    session: Weak<Session<S, R, L>>,
    mut stream: crate::remote::LiveStream,
) -> JoinHandle<()>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            session.handle_live_event(event).await;
        }
        tracing::debug!("live stream ended");
    })
}

fn spawn_depth_listener<S, R, L>(
    session: Weak<Session<S, R, L>>,
    mut depth: watch::Receiver<usize>,
) -> JoinHandle<()>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    tokio::spawn(async move {
        while depth.changed().await.is_ok() {
            let current = *depth.borrow_and_update();
            let Some(session) = session.upgrade() else {
                return;
            };
            session.emit(SyncEvent::QueueDepth(current));
        }
    })
}

fn spawn_connectivity_listener<S, R, L>(
    session: Weak<Session<S, R, L>>,
    mut online: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    tokio::spawn(async move {
        while online.changed().await.is_ok() {
            let connected = *online.borrow_and_update();
            let Some(session) = session.upgrade() else {
                return;
            };
            session.emit(SyncEvent::ConnectionChanged { connected });
            if connected && let Err(e) = session.refresh().await {
                tracing::debug!(error = %e, "refresh after reconnect failed");
            }
        }
    })
}
