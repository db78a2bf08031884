//! Ordered message list primitives shared by the cache and the coordinator.
//!
//! A timeline is a `Vec<Message>` sorted by `created_at`, oldest first, with
//! unique ids. Every function here preserves both properties.

use std::collections::HashSet;

use chatsync_proto::message::{Message, MessageId, Timestamp};

/// Result of merging a remote copy of a message into a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The id was new and the message was inserted at this index.
    Inserted(usize),
    /// An existing entry changed and now sits at this index.
    Updated(usize),
    /// The incoming copy carried nothing newer.
    Unchanged,
}

/// Index at which a message created at `created_at` belongs.
///
/// Equal timestamps keep arrival order: the new entry goes after them.
#[must_use]
pub fn insertion_index(messages: &[Message], created_at: Timestamp) -> usize {
    messages.partition_point(|m| m.created_at <= created_at)
}

/// Position of the message with `id`, if present.
#[must_use]
pub fn position_of(messages: &[Message], id: &MessageId) -> Option<usize> {
    messages.iter().position(|m| &m.id == id)
}

/// Inserts `message` at its chronological position and returns the index.
///
/// The caller guarantees the id is not already present.
pub fn insert_chronological(messages: &mut Vec<Message>, message: Message) -> usize {
    let idx = insertion_index(messages, message.created_at);
    messages.insert(idx, message);
    idx
}

/// Inserts `message`, or replaces the entry with the same id outright.
///
/// A replaced entry is repositioned if its `created_at` changed.
pub fn replace_or_insert(messages: &mut Vec<Message>, message: Message) -> usize {
    if let Some(pos) = position_of(messages, &message.id) {
        if messages[pos].created_at == message.created_at {
            messages[pos] = message;
            return pos;
        }
        messages.remove(pos);
    }
    insert_chronological(messages, message)
}

/// Merges a remote copy of a message using last-writer-wins.
///
/// Content and timestamps come from whichever copy has the later
/// [`Message::last_write`] (ties go to the incoming copy). Delivery maps
/// are merged forward-only regardless of which copy wins.
pub fn merge_remote(messages: &mut Vec<Message>, incoming: Message) -> MergeOutcome {
    let Some(pos) = position_of(messages, &incoming.id) else {
        return MergeOutcome::Inserted(insert_chronological(messages, incoming));
    };

    let existing = &messages[pos];
    let mut merged = if incoming.last_write() >= existing.last_write() {
        let mut winner = incoming.clone();
        winner.merge_delivery(&existing.delivery_by_recipient);
        winner
    } else {
        let mut winner = existing.clone();
        winner.merge_delivery(&incoming.delivery_by_recipient);
        winner
    };

    if merged == *existing {
        return MergeOutcome::Unchanged;
    }

    if merged.created_at == existing.created_at {
        std::mem::swap(&mut messages[pos], &mut merged);
        MergeOutcome::Updated(pos)
    } else {
        messages.remove(pos);
        MergeOutcome::Updated(insert_chronological(messages, merged))
    }
}

/// Sorts by `created_at` (stable) and drops duplicate ids, keeping the last
/// occurrence of each.
#[must_use]
pub fn normalize(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut deduped: Vec<Message> = messages
        .into_iter()
        .rev()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    deduped.reverse();
    deduped.sort_by_key(|m| m.created_at);
    deduped
}

/// Trims a timeline to its `capacity` most recent entries.
///
/// Only entries outside the `capacity` most recent are candidates, oldest
/// first. Entries with temporary ids are never evicted, so the result can
/// exceed `capacity` while sends are unresolved. Returns the evicted ids.
pub fn truncate_to_recent(messages: &mut Vec<Message>, capacity: usize) -> Vec<MessageId> {
    let excess = messages.len().saturating_sub(capacity);
    if excess == 0 {
        return Vec::new();
    }

    let mut evicted = Vec::with_capacity(excess);
    let mut index = 0;
    messages.retain(|m| {
        let candidate = index < excess;
        index += 1;
        if candidate && !m.id.is_temporary() {
            evicted.push(m.id.clone());
            false
        } else {
            true
        }
    });
    evicted
}
