//! Bounded, crash-durable per-conversation message cache.
//!
//! The [`LocalCacheStore`] keeps the most recent messages of each
//! conversation in memory and mirrors them into a [`KeyValueStore`] under
//! `messages_{conversation}`.
//!
//! # Degraded mode
//!
//! If the underlying persistence fails (disk full, unreadable payload, …):
//! 1. The error is logged, never propagated.
//! 2. The store stops touching persistence for the rest of the session and
//!    keeps serving from memory.
//! 3. A [`CacheWarning::Degraded`] is emitted once so the caller can show
//!    "messages will not be kept offline".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use chatsync_proto::codec;
use chatsync_proto::message::{ConversationId, Message, MessageId};

use crate::store::{KeyValueStore, StoreError};
use crate::timeline;

/// Key prefix for per-conversation cache entries.
const MESSAGES_PREFIX: &str = "messages_";

/// Warning emitted when the cache loses its persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWarning {
    /// Persistence failed; the cache is now memory-only for this session.
    Degraded {
        /// Description of the failure that triggered degraded mode.
        reason: String,
    },
}

/// Per-conversation bounded message cache with durable backing.
///
/// Every timeline is kept sorted by `created_at`, oldest first, and
/// truncated to the `capacity` most recent messages after each write.
/// Messages with temporary ids are never evicted.
pub struct LocalCacheStore<S: KeyValueStore> {
    store: S,
    capacity: usize,
    conversations: Mutex<HashMap<ConversationId, Vec<Message>>>,
    degraded: AtomicBool,
    warning_tx: mpsc::Sender<CacheWarning>,
}

impl<S: KeyValueStore> LocalCacheStore<S> {
    /// Create a cache over `store` keeping `capacity` messages per
    /// conversation.
    ///
    /// Returns the cache and a receiver for [`CacheWarning`]s.
    #[must_use]
    pub fn new(
        store: S,
        capacity: usize,
        warning_buffer: usize,
    ) -> (Self, mpsc::Receiver<CacheWarning>) {
        let (warning_tx, warning_rx) = mpsc::channel(warning_buffer);
        let cache = Self {
            store,
            capacity,
            conversations: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            warning_tx,
        };
        (cache, warning_rx)
    }

    /// Maximum number of messages kept per conversation.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether persistence has failed and the cache is memory-only.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Ordered messages of a conversation, newest last.
    pub async fn load(&self, conversation: &ConversationId) -> Vec<Message> {
        let mut map = self.conversations.lock().await;
        self.hydrate(&mut map, conversation).await.clone()
    }

    /// Replaces a conversation's cached timeline.
    ///
    /// The input is sorted by `created_at` and deduplicated by id (last
    /// occurrence wins) before truncation.
    pub async fn save(&self, conversation: &ConversationId, messages: Vec<Message>) {
        let mut map = self.conversations.lock().await;
        let mut normalized = timeline::normalize(messages);
        // Temporary entries are still owed to the outbound queue.
        if let Some(existing) = map.get(conversation) {
            for pending in existing.iter().filter(|m| m.id.is_temporary()) {
                if timeline::position_of(&normalized, &pending.id).is_none() {
                    timeline::insert_chronological(&mut normalized, pending.clone());
                }
            }
        }
        let messages = map.entry(conversation.clone()).or_default();
        *messages = normalized;
        self.truncate(conversation, messages);
        self.persist(conversation, messages).await;
    }

    /// Inserts a message at its chronological position.
    ///
    /// An entry with the same id is replaced.
    pub async fn append(&self, conversation: &ConversationId, message: Message) {
        let mut map = self.conversations.lock().await;
        let messages = self.hydrate(&mut map, conversation).await;
        timeline::replace_or_insert(messages, message);
        self.truncate(conversation, messages);
        self.persist(conversation, messages).await;
    }

    /// Inserts only the messages whose ids are not cached yet.
    ///
    /// Existing entries are never overwritten. Returns how many were added.
    pub async fn backfill(&self, conversation: &ConversationId, older: Vec<Message>) -> usize {
        let mut map = self.conversations.lock().await;
        let messages = self.hydrate(&mut map, conversation).await;
        let mut added = 0;
        for message in older {
            if timeline::position_of(messages, &message.id).is_none() {
                timeline::insert_chronological(messages, message);
                added += 1;
            }
        }
        if added > 0 {
            self.truncate(conversation, messages);
            self.persist(conversation, messages).await;
        }
        added
    }

    /// Replaces a temporary entry with its confirmed counterpart in a
    /// single persisted write.
    ///
    /// Idempotent: if the temporary entry is already gone, the confirmed
    /// message is merged as a regular remote copy.
    pub async fn resolve(
        &self,
        conversation: &ConversationId,
        temporary_id: &MessageId,
        confirmed: Message,
    ) {
        let mut map = self.conversations.lock().await;
        let messages = self.hydrate(&mut map, conversation).await;
        if let Some(pos) = timeline::position_of(messages, temporary_id) {
            messages.remove(pos);
        }
        timeline::merge_remote(messages, confirmed);
        self.truncate(conversation, messages);
        self.persist(conversation, messages).await;
    }

    /// Removes a message. Returns `true` if it was cached.
    pub async fn remove(&self, conversation: &ConversationId, message_id: &MessageId) -> bool {
        let mut map = self.conversations.lock().await;
        let messages = self.hydrate(&mut map, conversation).await;
        let Some(pos) = timeline::position_of(messages, message_id) else {
            return false;
        };
        messages.remove(pos);
        self.persist(conversation, messages).await;
        true
    }

    /// Drops a conversation's cache, in memory and on disk.
    pub async fn clear(&self, conversation: &ConversationId) {
        let mut map = self.conversations.lock().await;
        map.insert(conversation.clone(), Vec::new());
        if self.is_degraded() {
            return;
        }
        if let Err(err) = self.store.remove(&cache_key(conversation)).await {
            self.degrade(conversation, &err);
        }
    }

    /// Returns the in-memory timeline, reading it from persistence first if
    /// this is the conversation's first access in the session.
    async fn hydrate<'m>(
        &self,
        map: &'m mut HashMap<ConversationId, Vec<Message>>,
        conversation: &ConversationId,
    ) -> &'m mut Vec<Message> {
        if !map.contains_key(conversation) {
            let restored = self.read_persisted(conversation).await;
            map.insert(conversation.clone(), restored);
        }
        map.entry(conversation.clone()).or_default()
    }

    async fn read_persisted(&self, conversation: &ConversationId) -> Vec<Message> {
        if self.is_degraded() {
            return Vec::new();
        }
        let key = cache_key(conversation);
        let result = match self.store.get(&key).await {
            Ok(Some(bytes)) => codec::decode::<Vec<Message>>(&bytes)
                .map_err(|source| StoreError::Corrupt { key, source }),
            Ok(None) => Ok(Vec::new()),
            Err(err) => Err(err),
        };
        match result {
            Ok(messages) => {
                tracing::debug!(
                    conversation = %conversation,
                    count = messages.len(),
                    "restored cached messages"
                );
                timeline::normalize(messages)
            }
            Err(err) => {
                self.degrade(conversation, &err);
                Vec::new()
            }
        }
    }

    fn truncate(&self, conversation: &ConversationId, messages: &mut Vec<Message>) {
        let evicted = timeline::truncate_to_recent(messages, self.capacity);
        if !evicted.is_empty() {
            tracing::trace!(
                conversation = %conversation,
                evicted = evicted.len(),
                "evicted oldest cached messages"
            );
        }
    }

    async fn persist(&self, conversation: &ConversationId, messages: &[Message]) {
        if self.is_degraded() {
            return;
        }
        let result = match codec::encode(messages) {
            Ok(bytes) => self.store.set(&cache_key(conversation), bytes).await,
            Err(e) => Err(StoreError::WriteFailed(e.to_string())),
        };
        if let Err(err) = result {
            self.degrade(conversation, &err);
        }
    }

    fn degrade(&self, conversation: &ConversationId, err: &StoreError) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            conversation = %conversation,
            error = %err,
            "cache persistence failed, continuing in memory only"
        );
        // Best-effort warning emission; if the channel is full, drop it.
        let _ = self.warning_tx.try_send(CacheWarning::Degraded {
            reason: err.to_string(),
        });
    }
}

fn cache_key(conversation: &ConversationId) -> String {
    format!("{MESSAGES_PREFIX}{conversation}")
}
