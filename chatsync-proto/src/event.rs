//! Events delivered by the live push stream.

use serde::{Deserialize, Serialize};

use crate::message::{DeliveryState, Message, MessageId, UserId};

/// One item of a conversation's live event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveEvent {
    /// A message was inserted into the remote store.
    Inserted(Message),
    /// An existing message changed (edit or status change).
    Updated(Message),
    /// A recipient acknowledged a message.
    Receipt {
        /// Confirmed id of the acknowledged message.
        message_id: MessageId,
        /// Who acknowledged it.
        recipient: UserId,
        /// The acknowledged state.
        state: DeliveryState,
    },
    /// The live channel itself connected or dropped.
    Connectivity {
        /// Whether the subscription is currently connected.
        connected: bool,
    },
}

impl LiveEvent {
    /// Returns the message carried by an insert or update event.
    #[must_use]
    pub const fn message(&self) -> Option<&Message> {
        match self {
            Self::Inserted(msg) | Self::Updated(msg) => Some(msg),
            Self::Receipt { .. } | Self::Connectivity { .. } => None,
        }
    }
}
