//! Per-message, per-recipient delivery status.
//!
//! States only move forward (`Sent < Delivered < Read`). All transitions go
//! through one mutex, so concurrent receipts for the same
//! (message, recipient) pair are applied one at a time.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use chatsync_proto::message::{DeliveryState, MessageId, UserId};

/// Aggregate delivery status of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    /// Recipients at `Delivered` or `Read`.
    pub delivered_count: usize,
    /// Recipients at `Read`.
    pub read_count: usize,
    /// Recipients the message was sent to.
    pub total_recipients: usize,
}

impl DeliverySummary {
    /// Whether every recipient has read the message.
    #[must_use]
    pub const fn is_read_by_all(&self) -> bool {
        self.total_recipients > 0 && self.read_count == self.total_recipients
    }
}

#[derive(Debug, Default)]
struct Entry {
    total_recipients: usize,
    states: BTreeMap<UserId, DeliveryState>,
}

impl Entry {
    fn advance(&mut self, recipient: &UserId, state: DeliveryState) -> bool {
        match self.states.get_mut(recipient) {
            Some(current) if state > *current => {
                *current = state;
                true
            }
            Some(_) => false,
            None => {
                self.states.insert(recipient.clone(), state);
                true
            }
        }
    }

    fn summary(&self) -> DeliverySummary {
        let delivered_count = self
            .states
            .values()
            .filter(|s| **s >= DeliveryState::Delivered)
            .count();
        let read_count = self
            .states
            .values()
            .filter(|s| **s == DeliveryState::Read)
            .count();
        DeliverySummary {
            delivered_count,
            read_count,
            total_recipients: self.total_recipients.max(self.states.len()),
        }
    }
}

/// Tracks delivery state of sent and received messages.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: Mutex<HashMap<MessageId, Entry>>,
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `recipients` at `Sent` and fixes the recipient count.
    ///
    /// Recipients already further along keep their state.
    pub fn mark_sent(&self, message_id: &MessageId, recipients: &[UserId]) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(message_id.clone()).or_default();
        entry.total_recipients = recipients.len();
        for recipient in recipients {
            entry.advance(recipient, DeliveryState::Sent);
        }
    }

    /// Moves `recipient` to `Delivered`. No-op if already delivered or read.
    pub fn mark_delivered(&self, message_id: &MessageId, recipient: &UserId) -> bool {
        self.apply(message_id, recipient, DeliveryState::Delivered)
    }

    /// Moves `recipient` to `Read`. No-op if already read.
    pub fn mark_read(&self, message_id: &MessageId, recipient: &UserId) -> bool {
        self.apply(message_id, recipient, DeliveryState::Read)
    }

    /// Applies a forward-only transition. Returns `true` if the state changed.
    pub fn apply(&self, message_id: &MessageId, recipient: &UserId, state: DeliveryState) -> bool {
        let changed = self
            .entries
            .lock()
            .entry(message_id.clone())
            .or_default()
            .advance(recipient, state);
        if changed {
            tracing::trace!(
                message_id = %message_id,
                recipient = %recipient,
                state = %state,
                "delivery state advanced"
            );
        }
        changed
    }

    /// Current state of one recipient, if known.
    #[must_use]
    pub fn state(&self, message_id: &MessageId, recipient: &UserId) -> Option<DeliveryState> {
        self.entries
            .lock()
            .get(message_id)
            .and_then(|e| e.states.get(recipient).copied())
    }

    /// Snapshot of every recipient's state for a message.
    #[must_use]
    pub fn states(&self, message_id: &MessageId) -> BTreeMap<UserId, DeliveryState> {
        self.entries
            .lock()
            .get(message_id)
            .map(|e| e.states.clone())
            .unwrap_or_default()
    }

    /// Aggregate status; all zero for an unknown message.
    #[must_use]
    pub fn status_for(&self, message_id: &MessageId) -> DeliverySummary {
        self.entries
            .lock()
            .get(message_id)
            .map(Entry::summary)
            .unwrap_or_default()
    }

    /// Moves everything recorded under `temporary` onto `confirmed`.
    pub fn rekey(&self, temporary: &MessageId, confirmed: &MessageId) {
        let mut entries = self.entries.lock();
        let Some(old) = entries.remove(temporary) else {
            return;
        };
        let entry = entries.entry(confirmed.clone()).or_default();
        entry.total_recipients = entry.total_recipients.max(old.total_recipients);
        for (recipient, state) in &old.states {
            entry.advance(recipient, *state);
        }
    }

    /// Drops all state for a message.
    pub fn forget(&self, message_id: &MessageId) {
        self.entries.lock().remove(message_id);
    }
}
