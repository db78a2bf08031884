//! Outbound side of the coordinator.
//!
//! A send is optimistic: the message shows up in the view under a
//! temporary id at once, then moves through the outbound queue. Queue
//! events resolve the temporary id, schedule retries, or mark it failed.

use chatsync_proto::message::{Message, MessageContent, MessageId, PendingMessage, Timestamp};

use crate::lifecycle::{MessagePhase, TransitionError};
use crate::queue::QueueEvent;
use crate::remote::{LiveEventSource, RemoteStore};
use crate::store::KeyValueStore;
use crate::timeline;

use super::{ChangeOrigin, Resolution, Session, SyncError, SyncEvent};

impl<S, R, L> Session<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    /// Send pipeline:
    /// 1. Sanitize and validate the content
    /// 2. Mint a temporary id; keep the local user's send order
    /// 3. Insert into view and cache
    /// 4. Hand to the outbound queue
    pub(super) async fn send(&self, content: MessageContent) -> Result<MessageId, SyncError> {
        let content = content.sanitized();
        content.validate()?;

        let mut state = self.state.lock().await;
        let mut created_at = Timestamp::now();
        if let Some(last_own) = state
            .messages
            .iter()
            .rev()
            .find(|m| m.sender_id == self.ctx.local_user)
            && created_at <= last_own.created_at
        {
            created_at = last_own.created_at.next();
        }
        let message = Message::outgoing(
            self.conversation.clone(),
            self.ctx.local_user.clone(),
            content,
            created_at,
        );
        let id = message.id.clone();

        let composed = MessagePhase::Composed;
        let queued = composed.enqueued()?;
        state.phases.insert(id.clone(), queued.clone());
        timeline::insert_chronological(&mut state.messages, message.clone());
        self.ctx.cache.append(&self.conversation, message.clone()).await;
        let snapshot = state.messages.clone();
        drop(state);

        self.emit(SyncEvent::PhaseChanged {
            id: id.clone(),
            phase: composed,
        });
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::LocalSend,
        });
        self.note_cache_health();

        if let Err(e) = self.ctx.queue.enqueue(PendingMessage::new(message)).await {
            self.mark_failed(&id, e.to_string()).await;
            return Err(e.into());
        }
        self.emit(SyncEvent::PhaseChanged {
            id: id.clone(),
            phase: queued,
        });
        tracing::debug!(conversation = %self.conversation, message_id = %id, "message queued");
        Ok(id)
    }

    pub(super) async fn apply_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Confirmed {
                temporary_id,
                message,
            } => {
                if message.conversation_id == self.conversation {
                    self.apply_confirmation(&temporary_id, message).await;
                }
            }
            QueueEvent::Retrying { id, attempt, .. } => {
                let mut state = self.state.lock().await;
                let Some(phase) = state.phases.get_mut(&id) else {
                    return;
                };
                if let Err(e) = phase.retry_scheduled() {
                    tracing::debug!(message_id = %id, error = %e, "ignoring late retry");
                    return;
                }
                // The queue's attempt count is authoritative.
                let next = MessagePhase::Queued { attempt };
                if *phase == next {
                    return;
                }
                *phase = next.clone();
                drop(state);
                self.emit(SyncEvent::PhaseChanged { id, phase: next });
            }
            QueueEvent::Failed {
                id,
                conversation,
                error,
            } => {
                if conversation == self.conversation {
                    self.mark_failed(&id, error.to_string()).await;
                    self.emit(SyncEvent::SendFailed { id, error });
                }
            }
        }
    }

    /// Replaces a temporary id with its confirmed message. Applied once per
    /// temporary id.
    async fn apply_confirmation(&self, temporary_id: &MessageId, confirmed: Message) {
        let recipients = {
            let state = self.state.lock().await;
            if matches!(
                state.resolutions.get(temporary_id),
                Some(Resolution::Confirmed(_))
            ) {
                return;
            }
            state.recipients.clone()
        };
        let recipients = if recipients.is_empty() {
            self.load_recipients().await
        } else {
            recipients
        };

        let confirmed_id = confirmed.id.clone();
        let mut state = self.state.lock().await;
        if matches!(
            state.resolutions.get(temporary_id),
            Some(Resolution::Confirmed(_))
        ) {
            return;
        }

        if let Some(pos) = timeline::position_of(&state.messages, temporary_id) {
            state.messages.remove(pos);
        }
        state
            .resolutions
            .insert(temporary_id.clone(), Resolution::Confirmed(confirmed_id.clone()));

        self.tracker.rekey(temporary_id, &confirmed_id);
        self.tracker.mark_sent(&confirmed_id, &recipients);
        let mut phase = state
            .phases
            .get(temporary_id)
            .and_then(|p| p.confirmed().ok())
            .unwrap_or(MessagePhase::Sent);
        let early: Vec<_> = state
            .early_receipts
            .iter()
            .filter(|(id, _, _)| id == &confirmed_id)
            .cloned()
            .collect();
        state.early_receipts.retain(|(id, _, _)| id != &confirmed_id);
        for (_, recipient, delivery) in early {
            self.tracker.apply(&confirmed_id, &recipient, delivery);
            phase = phase.receipt(delivery).unwrap_or(phase);
        }

        let mut message = confirmed;
        message.merge_delivery(&self.tracker.states(&confirmed_id));
        state.phases.remove(temporary_id);
        state.phases.insert(confirmed_id.clone(), phase.clone());
        timeline::merge_remote(&mut state.messages, message.clone());
        self.ctx
            .cache
            .resolve(&self.conversation, temporary_id, message)
            .await;
        let snapshot = state.messages.clone();
        drop(state);

        tracing::debug!(
            conversation = %self.conversation,
            temporary_id = %temporary_id,
            confirmed_id = %confirmed_id,
            "resolved temporary id"
        );
        self.emit(SyncEvent::IdResolved {
            temporary_id: temporary_id.clone(),
            confirmed_id: confirmed_id.clone(),
        });
        self.emit(SyncEvent::PhaseChanged {
            id: confirmed_id,
            phase,
        });
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Resolution,
        });
    }

    async fn mark_failed(&self, id: &MessageId, reason: String) {
        let mut state = self.state.lock().await;
        let Some(current) = state.phases.get(id) else {
            return;
        };
        let phase = match current.failed(reason.clone()) {
            Ok(phase) => phase,
            Err(e) => {
                tracing::debug!(message_id = %id, error = %e, "ignoring late failure");
                return;
            }
        };
        state.phases.insert(id.clone(), phase.clone());
        state
            .resolutions
            .insert(id.clone(), Resolution::Failed(reason));
        drop(state);
        self.emit(SyncEvent::PhaseChanged {
            id: id.clone(),
            phase,
        });
    }

    pub(super) async fn retry_failed(&self, temporary_id: &MessageId) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let phase = state
            .phases
            .get(temporary_id)
            .ok_or_else(|| SyncError::UnknownMessage(temporary_id.clone()))?;
        if !phase.is_failed() {
            return Err(TransitionError {
                from: phase.clone(),
                transition: "retry",
            }
            .into());
        }
        let queued = phase.enqueued()?;
        let message = timeline::position_of(&state.messages, temporary_id)
            .map(|pos| state.messages[pos].clone())
            .ok_or_else(|| SyncError::UnknownMessage(temporary_id.clone()))?;
        state.phases.insert(temporary_id.clone(), queued.clone());
        state.resolutions.remove(temporary_id);
        drop(state);

        self.ctx.queue.enqueue(PendingMessage::new(message)).await?;
        tracing::info!(message_id = %temporary_id, "retrying failed message");
        self.emit(SyncEvent::PhaseChanged {
            id: temporary_id.clone(),
            phase: queued,
        });
        self.ctx.queue.flush().await?;
        Ok(())
    }

    pub(super) async fn discard(&self, temporary_id: &MessageId) -> Result<bool, SyncError> {
        if !temporary_id.is_temporary() {
            return Err(SyncError::NotTemporary(temporary_id.clone()));
        }
        let dequeued = self.ctx.queue.remove(temporary_id).await?;

        let mut state = self.state.lock().await;
        let Some(pos) = timeline::position_of(&state.messages, temporary_id) else {
            return Ok(dequeued);
        };
        state.messages.remove(pos);
        state.phases.remove(temporary_id);
        state.resolutions.remove(temporary_id);
        self.tracker.forget(temporary_id);
        self.ctx
            .cache
            .remove(&self.conversation, temporary_id)
            .await;
        let snapshot = state.messages.clone();
        drop(state);

        tracing::info!(message_id = %temporary_id, "discarded unsent message");
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Discard,
        });
        Ok(true)
    }
}

