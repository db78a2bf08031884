//! Message model shared by every `ChatSync` component.
//!
//! These types describe messages as they live in the local cache, the
//! outbound queue and the remote store. They are plain serde types so the
//! persistence layer can encode them with [`crate::codec`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed text payload size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix carried by every locally minted temporary id.
pub const TEMPORARY_ID_PREFIX: &str = "tmp_";

/// Identifier of a message.
///
/// Either a locally minted temporary id (see [`MessageId::temporary`]) used
/// for optimistic display, or the canonical id issued by the remote store
/// once a send is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing id string (typically a server-issued confirmed id).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh temporary id (`tmp_` + UUID v7).
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Whether this id was minted locally and has not been confirmed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a conversation (direct thread or group).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a conversation id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a user: the sender of a message or one of its recipients.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps a user id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp one millisecond later (saturating).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of a message, derived from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Recorded voice clip.
    Voice,
}

/// Content of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    /// Plain text message content.
    Text(String),
    /// Reference to an uploaded voice payload.
    Voice {
        /// Location of the binary audio payload.
        url: String,
        /// Clip length in seconds.
        duration_secs: u32,
        /// Optional transcription shown alongside the clip.
        transcript: Option<String>,
    },
}

impl MessageContent {
    /// Returns the [`MessageKind`] of this content.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Voice { .. } => MessageKind::Voice,
        }
    }

    /// Normalizes user input before it is sent.
    ///
    /// Text loses NUL characters and surrounding whitespace; voice
    /// transcripts get the same treatment and collapse to `None` when empty.
    #[must_use]
    pub fn sanitized(self) -> Self {
        match self {
            Self::Text(text) => Self::Text(sanitize_text(&text)),
            Self::Voice {
                url,
                duration_secs,
                transcript,
            } => Self::Voice {
                url: url.trim().to_string(),
                duration_secs,
                transcript: transcript
                    .map(|t| sanitize_text(&t))
                    .filter(|t| !t.is_empty()),
            },
        }
    }

    /// Validates this content for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for empty text,
    /// [`ValidationError::TooLarge`] for text over [`MAX_MESSAGE_SIZE`], and
    /// [`ValidationError::InvalidVoice`] for a voice clip without a URL or
    /// with zero duration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Text(text) => {
                if text.is_empty() {
                    return Err(ValidationError::Empty);
                }
                let size = text.len();
                if size > MAX_MESSAGE_SIZE {
                    return Err(ValidationError::TooLarge {
                        size,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
            }
            Self::Voice {
                url, duration_secs, ..
            } => {
                if url.is_empty() {
                    return Err(ValidationError::InvalidVoice("missing payload url"));
                }
                if *duration_secs == 0 {
                    return Err(ValidationError::InvalidVoice("zero duration"));
                }
            }
        }
        Ok(())
    }
}

/// Strips NUL characters and surrounding whitespace.
#[must_use]
pub fn sanitize_text(text: &str) -> String {
    text.replace('\u{0}', "").trim().to_string()
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Voice content is unusable.
    #[error("invalid voice message: {0}")]
    InvalidVoice(&'static str),
}

/// Per-recipient delivery state. Ordered `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Accepted by the remote store.
    Sent,
    /// Reached the recipient's device.
    Delivered,
    /// Seen by the recipient.
    Read,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => f.write_str("sent"),
            Self::Delivered => f.write_str("delivered"),
            Self::Read => f.write_str("read"),
        }
    }
}

/// A chat message as held by the cache, the queue and the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Temporary or confirmed identifier.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text or voice payload.
    pub content: MessageContent,
    /// Creation time: sender clock locally, server clock once confirmed.
    pub created_at: Timestamp,
    /// Last edit time, if the message was edited.
    pub edited_at: Option<Timestamp>,
    /// Delivery state per recipient.
    pub delivery_by_recipient: BTreeMap<UserId, DeliveryState>,
}

impl Message {
    /// Builds a fresh, unconfirmed outgoing message with a temporary id.
    #[must_use]
    pub fn outgoing(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::temporary(),
            conversation_id,
            sender_id,
            content,
            created_at,
            edited_at: None,
            delivery_by_recipient: BTreeMap::new(),
        }
    }

    /// Returns the [`MessageKind`] of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    /// Timestamp of the last write, used for last-writer-wins.
    #[must_use]
    pub fn last_write(&self) -> Timestamp {
        self.edited_at.unwrap_or(self.created_at)
    }

    /// Merges another message's delivery map into this one, forward only.
    ///
    /// Returns `true` if any recipient's state advanced.
    pub fn merge_delivery(&mut self, other: &BTreeMap<UserId, DeliveryState>) -> bool {
        let mut changed = false;
        for (recipient, state) in other {
            match self.delivery_by_recipient.get_mut(recipient) {
                Some(current) if *state > *current => {
                    *current = *state;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.delivery_by_recipient.insert(recipient.clone(), *state);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// A message that has not yet been confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// The optimistic message, keyed by its temporary id.
    pub message: Message,
    /// Number of send attempts made so far.
    pub attempt: u32,
}

impl PendingMessage {
    /// Wraps a message that has never been attempted.
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self {
            message,
            attempt: 0,
        }
    }

    /// The temporary id of the wrapped message.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// The conversation the message is destined for.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.message.conversation_id
    }
}
