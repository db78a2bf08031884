//! Contracts for everything the sync core talks to over the network.
//!
//! Defines the collaborator traits the coordinator and outbound queue are
//! generic over:
//! - [`RemoteStore`]: durable message store (fetch, send, status update)
//! - [`LiveEventSource`]: per-conversation push stream
//! - [`TextProcessor`]: translate/transcribe capability
//!
//! plus [`Connectivity`], the shared online/offline signal. Concrete
//! in-process implementations live in [`loopback`].

pub mod loopback;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::sync::watch;

use chatsync_proto::event::LiveEvent;
use chatsync_proto::message::{
    ConversationId, DeliveryState, Message, MessageContent, MessageId, UserId,
};

/// Stream of live events for one conversation.
pub type LiveStream = BoxStream<'static, LiveEvent>;

/// Errors returned by remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The call did not complete within its deadline.
    #[error("remote call timed out")]
    Timeout,

    /// The remote could not be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote reported a transient internal error.
    #[error("server error: {0}")]
    Server(String),

    /// The payload exceeds what the remote accepts.
    #[error("payload too large: {size} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload in bytes.
        size: usize,
    },

    /// The remote rejected the request as malformed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The caller is not allowed to perform the request.
    #[error("unauthorized")]
    Unauthorized,
}

impl RemoteError {
    /// Whether retrying the same request later can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_) | Self::Server(_))
    }
}

/// Durable remote message store.
pub trait RemoteStore: Send + Sync {
    /// Fetches up to `limit` messages, skipping the `offset` newest.
    ///
    /// Messages are ranked newest-first for paging; each returned page is
    /// ordered oldest-first.
    fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, RemoteError>> + Send;

    /// Durably stores a new message and returns it with its confirmed id and
    /// server timestamp.
    fn send_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &MessageContent,
    ) -> impl std::future::Future<Output = Result<Message, RemoteError>> + Send;

    /// Records a recipient's delivery state for a message.
    fn update_delivery_status(
        &self,
        message_id: &MessageId,
        recipient: &UserId,
        state: DeliveryState,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Members of a conversation, including the local user.
    fn participants(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<Vec<UserId>, RemoteError>> + Send;
}

/// Source of live push events.
pub trait LiveEventSource: Send + Sync {
    /// Opens the live stream for a conversation.
    fn subscribe(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<LiveStream, RemoteError>> + Send;

    /// Releases the subscription for a conversation.
    fn unsubscribe(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = ()> + Send;
}

impl<R: RemoteStore> RemoteStore for Arc<R> {
    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RemoteError> {
        self.as_ref()
            .fetch_messages(conversation, limit, offset)
            .await
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &MessageContent,
    ) -> Result<Message, RemoteError> {
        self.as_ref()
            .send_message(conversation, sender, content)
            .await
    }

    async fn update_delivery_status(
        &self,
        message_id: &MessageId,
        recipient: &UserId,
        state: DeliveryState,
    ) -> Result<(), RemoteError> {
        self.as_ref()
            .update_delivery_status(message_id, recipient, state)
            .await
    }

    async fn participants(&self, conversation: &ConversationId) -> Result<Vec<UserId>, RemoteError> {
        self.as_ref().participants(conversation).await
    }
}

impl<L: LiveEventSource> LiveEventSource for Arc<L> {
    async fn subscribe(&self, conversation: &ConversationId) -> Result<LiveStream, RemoteError> {
        self.as_ref().subscribe(conversation).await
    }

    async fn unsubscribe(&self, conversation: &ConversationId) {
        self.as_ref().unsubscribe(conversation).await;
    }
}

/// Text-processing capability (translation and speech-to-text).
pub trait TextProcessor: Send + Sync {
    /// Translates `text` into `target_language`.
    fn translate(
        &self,
        text: &str,
        target_language: &str,
    ) -> impl std::future::Future<Output = Result<String, RemoteError>> + Send;

    /// Transcribes the audio at `audio_url`.
    fn transcribe(
        &self,
        audio_url: &str,
    ) -> impl std::future::Future<Output = Result<String, RemoteError>> + Send;
}

/// Builds voice content with a best-effort transcript.
///
/// A failed or empty transcription leaves `transcript` as `None`; it never
/// prevents the voice message from being sent.
pub async fn compose_voice<P: TextProcessor>(
    processor: &P,
    url: impl Into<String>,
    duration_secs: u32,
) -> MessageContent {
    let url = url.into();
    let transcript = match processor.transcribe(&url).await {
        Ok(text) => Some(text).filter(|t| !t.trim().is_empty()),
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "transcription failed, sending without");
            None
        }
    };
    MessageContent::Voice {
        url,
        duration_secs,
        transcript,
    }
}

/// Shared online/offline signal.
///
/// Cloning yields another handle to the same signal. The outbound queue
/// watches it and starts a flush on every offline → online edge.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Creates a signal with the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a connectivity change. Repeating the current state is a
    /// no-op for watchers.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watches future changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
