//! In-process remote collaborators for testing and the demo binary.
//!
//! [`LoopbackRemote`] implements both [`RemoteStore`] and
//! [`LiveEventSource`] on top of an in-memory table. Accepted sends are
//! echoed to every live subscriber of the conversation, the way a real
//! backend's change feed would. Tests can script failures, take the remote
//! offline, slow sends down, and inject events from other users.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatsync_proto::event::LiveEvent;
use chatsync_proto::message::{
    ConversationId, DeliveryState, MAX_MESSAGE_SIZE, Message, MessageContent, MessageId,
    Timestamp, UserId,
};

use super::{LiveEventSource, LiveStream, RemoteError, RemoteStore, TextProcessor};

/// Buffer of each live subscription channel.
const LIVE_BUFFER: usize = 256;

#[derive(Default)]
struct State {
    online: bool,
    messages: HashMap<ConversationId, Vec<Message>>,
    participants: HashMap<ConversationId, Vec<UserId>>,
    subscribers: HashMap<ConversationId, Vec<mpsc::Sender<LiveEvent>>>,
    scripted_send_failures: VecDeque<RemoteError>,
    send_delay: Option<Duration>,
    participants_delay: Option<Duration>,
    last_timestamp: Timestamp,
    next_id: u64,
    status_updates: Vec<(MessageId, UserId, DeliveryState)>,
}

/// In-memory remote store with a live change feed.
pub struct LoopbackRemote {
    state: Mutex<State>,
    send_attempts: AtomicUsize,
}

impl Default for LoopbackRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRemote {
    /// Creates an online remote with no conversations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                online: true,
                ..State::default()
            }),
            send_attempts: AtomicUsize::new(0),
        }
    }

    /// Makes every call fail with [`RemoteError::Unavailable`] while offline.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Fails the next sends with the given errors, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.state.lock().scripted_send_failures.extend(errors);
    }

    /// Delays every send by `delay` before it is processed.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    /// Delays every participant lookup by `delay`.
    pub fn set_participants_delay(&self, delay: Option<Duration>) {
        self.state.lock().participants_delay = delay;
    }

    /// Registers the members of a conversation.
    pub fn set_participants(&self, conversation: &ConversationId, users: Vec<UserId>) {
        self.state
            .lock()
            .participants
            .insert(conversation.clone(), users);
    }

    /// Number of `send_message` calls made, failed ones included.
    #[must_use]
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// All messages stored for a conversation, oldest first.
    #[must_use]
    pub fn stored(&self, conversation: &ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Delivery status updates received so far.
    #[must_use]
    pub fn status_updates(&self) -> Vec<(MessageId, UserId, DeliveryState)> {
        self.state.lock().status_updates.clone()
    }

    /// Number of open live subscriptions for a conversation.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .subscribers
            .get(conversation)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }

    /// Stores a message written by another client and pushes it live.
    ///
    /// The message keeps its own id and timestamps.
    pub fn publish_incoming(&self, message: Message) {
        let mut state = self.state.lock();
        let conversation = message.conversation_id.clone();
        let stored = state.messages.entry(conversation.clone()).or_default();
        let idx = stored.partition_point(|m| m.created_at <= message.created_at);
        stored.insert(idx, message.clone());
        state.last_timestamp = state.last_timestamp.max(message.created_at);
        broadcast(&mut state, &conversation, &LiveEvent::Inserted(message));
    }

    /// Replaces a stored message and pushes an update event.
    pub fn publish_update(&self, message: Message) {
        let mut state = self.state.lock();
        let conversation = message.conversation_id.clone();
        if let Some(stored) = state.messages.get_mut(&conversation)
            && let Some(slot) = stored.iter_mut().find(|m| m.id == message.id)
        {
            *slot = message.clone();
        }
        broadcast(&mut state, &conversation, &LiveEvent::Updated(message));
    }

    /// Pushes a raw event to a conversation's subscribers without touching
    /// the stored table.
    pub fn push_event(&self, conversation: &ConversationId, event: LiveEvent) {
        broadcast(&mut self.state.lock(), conversation, &event);
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.state.lock().online {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("loopback remote offline".into()))
        }
    }
}

fn broadcast(state: &mut State, conversation: &ConversationId, event: &LiveEvent) {
    if let Some(subs) = state.subscribers.get_mut(conversation) {
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            if tx.try_send(event.clone()).is_err() {
                tracing::debug!(conversation = %conversation, "live subscriber lagging, event dropped");
            }
        }
    }
}

fn payload_size(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Voice {
            url, transcript, ..
        } => url.len() + transcript.as_ref().map_or(0, String::len),
    }
}

impl RemoteStore for LoopbackRemote {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RemoteError> {
        self.check_online()?;
        let state = self.state.lock();
        let Some(stored) = state.messages.get(conversation) else {
            return Ok(Vec::new());
        };
        let end = stored.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(stored[start..end].to_vec())
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &MessageContent,
    ) -> Result<Message, RemoteError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;

        let mut state = self.state.lock();
        if let Some(err) = state.scripted_send_failures.pop_front() {
            return Err(err);
        }
        let size = payload_size(content);
        if size > MAX_MESSAGE_SIZE {
            return Err(RemoteError::PayloadTooLarge { size });
        }

        state.next_id += 1;
        let created_at = Timestamp::now().max(state.last_timestamp.next());
        state.last_timestamp = created_at;
        let message = Message {
            id: MessageId::new(format!("srv_{}", state.next_id)),
            conversation_id: conversation.clone(),
            sender_id: sender.clone(),
            content: content.clone(),
            created_at,
            edited_at: None,
            delivery_by_recipient: std::collections::BTreeMap::new(),
        };
        state
            .messages
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        broadcast(&mut state, conversation, &LiveEvent::Inserted(message.clone()));
        Ok(message)
    }

    async fn update_delivery_status(
        &self,
        message_id: &MessageId,
        recipient: &UserId,
        state: DeliveryState,
    ) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut guard = self.state.lock();
        guard
            .status_updates
            .push((message_id.clone(), recipient.clone(), state));

        let owner = guard.messages.iter_mut().find_map(|(conversation, msgs)| {
            msgs.iter_mut()
                .find(|m| &m.id == message_id)
                .map(|m| (conversation.clone(), m))
        });
        let Some((conversation, message)) = owner else {
            return Ok(());
        };
        let mut update = std::collections::BTreeMap::new();
        update.insert(recipient.clone(), state);
        if message.merge_delivery(&update) {
            let event = LiveEvent::Receipt {
                message_id: message_id.clone(),
                recipient: recipient.clone(),
                state,
            };
            broadcast(&mut guard, &conversation, &event);
        }
        Ok(())
    }

    async fn participants(&self, conversation: &ConversationId) -> Result<Vec<UserId>, RemoteError> {
        let delay = self.state.lock().participants_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;
        Ok(self
            .state
            .lock()
            .participants
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }
}

impl LiveEventSource for LoopbackRemote {
    async fn subscribe(&self, conversation: &ConversationId) -> Result<LiveStream, RemoteError> {
        let (tx, rx) = mpsc::channel(LIVE_BUFFER);
        self.state
            .lock()
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push(tx);
        tracing::debug!(conversation = %conversation, "live subscription opened");
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn unsubscribe(&self, conversation: &ConversationId) {
        self.state.lock().subscribers.remove(conversation);
        tracing::debug!(conversation = %conversation, "live subscription closed");
    }
}

/// Deterministic [`TextProcessor`] that tags its input instead of calling
/// a model.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackProcessor;

impl TextProcessor for LoopbackProcessor {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, RemoteError> {
        Ok(format!("[{target_language}] {text}"))
    }

    async fn transcribe(&self, audio_url: &str) -> Result<String, RemoteError> {
        let name = audio_url.rsplit('/').next().unwrap_or(audio_url);
        Ok(format!("transcript of {name}"))
    }
}
