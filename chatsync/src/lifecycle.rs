//! Per-message lifecycle state machine.
//!
//! ```text
//! Composed ──enqueued──▶ Queued{0} ──retry_scheduled──▶ Queued{n+1}
//!                           │  │
//!                 confirmed │  │ failed
//!                           ▼  ▼
//!                         Sent  Failed ──enqueued (caller retry)──▶ Queued{0}
//!                           │
//!                   receipt ▼
//!                  Delivered ──receipt──▶ Read
//! ```
//!
//! Transitions are pure: they consume nothing and either return the next
//! phase or a [`TransitionError`], leaving the caller's phase untouched.

use std::fmt;

use chatsync_proto::message::DeliveryState;

/// Where a message currently sits in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePhase {
    /// Created locally, not yet handed to the outbound queue.
    Composed,
    /// Waiting in the outbound queue.
    Queued {
        /// Send attempts made so far.
        attempt: u32,
    },
    /// Accepted by the remote store.
    Sent,
    /// At least one recipient received it.
    Delivered,
    /// At least one recipient read it.
    Read,
    /// Permanently failed; awaiting caller retry or discard.
    Failed {
        /// Human-readable failure cause.
        reason: String,
    },
}

impl fmt::Display for MessagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Composed => f.write_str("composed"),
            Self::Queued { attempt } => write!(f, "queued (attempt {attempt})"),
            Self::Sent => f.write_str("sent"),
            Self::Delivered => f.write_str("delivered"),
            Self::Read => f.write_str("read"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// A transition that is not allowed from the current phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {transition} from phase {from}")]
pub struct TransitionError {
    /// Phase the transition was attempted from.
    pub from: MessagePhase,
    /// Name of the attempted transition.
    pub transition: &'static str,
}

impl MessagePhase {
    /// Handed to the outbound queue, or re-queued by an explicit retry.
    ///
    /// # Errors
    ///
    /// Allowed only from `Composed` or `Failed`.
    pub fn enqueued(&self) -> Result<Self, TransitionError> {
        match self {
            Self::Composed | Self::Failed { .. } => Ok(Self::Queued { attempt: 0 }),
            _ => Err(self.reject("enqueue")),
        }
    }

    /// A send attempt failed with a retryable error.
    ///
    /// # Errors
    ///
    /// Allowed only from `Queued`.
    pub fn retry_scheduled(&self) -> Result<Self, TransitionError> {
        match self {
            Self::Queued { attempt } => Ok(Self::Queued {
                attempt: attempt.saturating_add(1),
            }),
            _ => Err(self.reject("schedule retry")),
        }
    }

    /// The remote store accepted the message.
    ///
    /// # Errors
    ///
    /// Allowed from `Queued` and, for a send that succeeded after the
    /// caller saw a failure, from `Failed`.
    pub fn confirmed(&self) -> Result<Self, TransitionError> {
        match self {
            Self::Queued { .. } | Self::Failed { .. } => Ok(Self::Sent),
            _ => Err(self.reject("confirm")),
        }
    }

    /// The send failed permanently.
    ///
    /// # Errors
    ///
    /// Not allowed once the message has been confirmed.
    pub fn failed(&self, reason: impl Into<String>) -> Result<Self, TransitionError> {
        match self {
            Self::Composed | Self::Queued { .. } | Self::Failed { .. } => Ok(Self::Failed {
                reason: reason.into(),
            }),
            _ => Err(self.reject("fail")),
        }
    }

    /// A recipient acknowledged the message.
    ///
    /// Receipts never move a phase backwards: a `Delivered` receipt on a
    /// `Read` message returns `Read`.
    ///
    /// # Errors
    ///
    /// Allowed only once the message is confirmed.
    pub fn receipt(&self, state: DeliveryState) -> Result<Self, TransitionError> {
        let current = match self {
            Self::Sent => DeliveryState::Sent,
            Self::Delivered => DeliveryState::Delivered,
            Self::Read => DeliveryState::Read,
            _ => return Err(self.reject("apply receipt")),
        };
        Ok(Self::from_delivery(current.max(state)))
    }

    /// Phase matching a delivery state.
    #[must_use]
    pub const fn from_delivery(state: DeliveryState) -> Self {
        match state {
            DeliveryState::Sent => Self::Sent,
            DeliveryState::Delivered => Self::Delivered,
            DeliveryState::Read => Self::Read,
        }
    }

    /// Whether the message still waits for the remote store.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Composed | Self::Queued { .. })
    }

    /// Whether the message failed permanently.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn reject(&self, transition: &'static str) -> TransitionError {
        TransitionError {
            from: self.clone(),
            transition,
        }
    }
}
