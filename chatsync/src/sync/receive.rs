//! Inbound side of the coordinator: live events, refresh, read receipts.
//!
//! Reconciliation of a remote message X against the view:
//! 1. X's id is in the view: update in place, last writer wins
//! 2. X was written by the local user: discard (own echo)
//! 3. Otherwise insert by `created_at` and acknowledge delivery

use std::sync::Arc;

use chatsync_proto::event::LiveEvent;
use chatsync_proto::message::{DeliveryState, Message, MessageId, Timestamp, UserId};

use crate::lifecycle::MessagePhase;
use crate::remote::{LiveEventSource, RemoteStore};
use crate::store::KeyValueStore;
use crate::timeline::{self, MergeOutcome};

use super::{
    ChangeOrigin, MAX_EARLY_RECEIPTS, Reconciliation, Session, SyncError, SyncEvent, ViewState,
    own_phase,
};

impl<S, R, L> Session<S, R, L>
where
    S: KeyValueStore + 'static,
    R: RemoteStore + 'static,
    L: LiveEventSource + 'static,
{
    pub(super) async fn handle_live_event(&self, event: LiveEvent) -> Reconciliation {
        match event {
            LiveEvent::Inserted(message) | LiveEvent::Updated(message) => {
                self.reconcile(message).await
            }
            LiveEvent::Receipt {
                message_id,
                recipient,
                state,
            } => self.apply_receipt(message_id, recipient, state).await,
            LiveEvent::Connectivity { connected } => {
                self.emit(SyncEvent::ConnectionChanged { connected });
                Reconciliation::Connectivity
            }
        }
    }

    async fn reconcile(&self, incoming: Message) -> Reconciliation {
        if incoming.conversation_id != self.conversation {
            return Reconciliation::Unchanged;
        }
        if incoming.id.is_temporary() {
            tracing::warn!(message_id = %incoming.id, "remote id in temporary namespace, ignoring");
            return Reconciliation::Unchanged;
        }
        let mut state = self.state.lock().await;

        if timeline::position_of(&state.messages, &incoming.id).is_some() {
            let id = incoming.id.clone();
            let MergeOutcome::Updated(pos) = timeline::merge_remote(&mut state.messages, incoming)
            else {
                return Reconciliation::Unchanged;
            };
            let merged = state.messages[pos].clone();
            for (recipient, delivery) in &merged.delivery_by_recipient {
                self.tracker.apply(&id, recipient, *delivery);
            }
            let phase_change = if merged.sender_id == self.ctx.local_user {
                let phase = own_phase(&merged);
                let previous = state.phases.insert(id.clone(), phase.clone());
                (previous.as_ref() != Some(&phase)).then_some(phase)
            } else {
                None
            };
            self.ctx.cache.append(&self.conversation, merged).await;
            let snapshot = state.messages.clone();
            drop(state);

            if let Some(phase) = phase_change {
                self.emit(SyncEvent::PhaseChanged { id, phase });
            }
            self.emit(SyncEvent::MessagesChanged {
                messages: snapshot,
                origin: ChangeOrigin::Live,
            });
            self.note_cache_health();
            return Reconciliation::Updated;
        }

        if incoming.sender_id == self.ctx.local_user {
            tracing::trace!(message_id = %incoming.id, "discarding own echo");
            return Reconciliation::OwnEcho;
        }

        let id = incoming.id.clone();
        let mut message = incoming;
        for (recipient, delivery) in &message.delivery_by_recipient {
            self.tracker.apply(&id, recipient, *delivery);
        }
        let newly_delivered = self.tracker.mark_delivered(&id, &self.ctx.local_user);
        message.merge_delivery(&self.tracker.states(&id));
        timeline::insert_chronological(&mut state.messages, message.clone());
        self.ctx.cache.append(&self.conversation, message).await;
        let snapshot = state.messages.clone();
        drop(state);

        tracing::debug!(conversation = %self.conversation, message_id = %id, "live message inserted");
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Live,
        });
        self.note_cache_health();
        if newly_delivered {
            self.acknowledge(id, DeliveryState::Delivered);
        }
        Reconciliation::Inserted
    }

    async fn apply_receipt(
        &self,
        message_id: MessageId,
        recipient: UserId,
        delivery: DeliveryState,
    ) -> Reconciliation {
        let mut state = self.state.lock().await;
        let Some(pos) = timeline::position_of(&state.messages, &message_id) else {
            if state.early_receipts.len() >= MAX_EARLY_RECEIPTS {
                state.early_receipts.pop_front();
            }
            state
                .early_receipts
                .push_back((message_id, recipient, delivery));
            return Reconciliation::ReceiptBuffered;
        };

        if !self.tracker.apply(&message_id, &recipient, delivery) {
            return Reconciliation::Unchanged;
        }
        let message = &mut state.messages[pos];
        message.merge_delivery(&self.tracker.states(&message_id));
        let updated = message.clone();

        let phase_change = match state.phases.get(&message_id) {
            Some(current) => match current.receipt(delivery) {
                Ok(next) if &next != current => Some(next),
                _ => None,
            },
            None => None,
        };
        if let Some(phase) = &phase_change {
            state.phases.insert(message_id.clone(), phase.clone());
        }
        self.ctx.cache.append(&self.conversation, updated).await;
        let snapshot = state.messages.clone();
        drop(state);

        if let Some(phase) = phase_change {
            self.emit(SyncEvent::PhaseChanged {
                id: message_id,
                phase,
            });
        }
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Live,
        });
        Reconciliation::ReceiptApplied
    }

    /// Reports the local user's delivery state to the remote without
    /// blocking the caller.
    fn acknowledge(&self, message_id: MessageId, delivery: DeliveryState) {
        let remote = Arc::clone(&self.ctx.remote);
        let local_user = self.ctx.local_user.clone();
        tokio::spawn(async move {
            if let Err(e) = remote
                .update_delivery_status(&message_id, &local_user, delivery)
                .await
            {
                tracing::warn!(
                    message_id = %message_id,
                    state = %delivery,
                    error = %e,
                    "failed to report delivery status"
                );
            }
        });
    }

    pub(super) async fn refresh(&self) -> Result<usize, SyncError> {
        let page = match self
            .ctx
            .remote
            .fetch_messages(&self.conversation, self.ctx.config.page_size, 0)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(conversation = %self.conversation, error = %error, "refresh failed");
                self.emit(SyncEvent::RefreshFailed {
                    error: error.clone(),
                });
                return Err(error.into());
            }
        };

        let mut state = self.state.lock().await;
        let mut changed = 0;
        let mut oldest: Option<Timestamp> = None;
        let mut joined = false;
        for message in page {
            if message.conversation_id != self.conversation {
                continue;
            }
            if message.id.is_temporary() {
                tracing::warn!(message_id = %message.id, "remote id in temporary namespace, ignoring");
                continue;
            }
            oldest = Some(oldest.map_or(message.created_at, |o| o.min(message.created_at)));
            joined |= timeline::position_of(&state.messages, &message.id).is_some();
            let own = message.sender_id == self.ctx.local_user;
            if own && awaits_confirmation(&state, &message) {
                continue;
            }
            for (recipient, delivery) in &message.delivery_by_recipient {
                self.tracker.apply(&message.id, recipient, *delivery);
            }
            let id = message.id.clone();
            if timeline::merge_remote(&mut state.messages, message) == MergeOutcome::Unchanged {
                continue;
            }
            changed += 1;
            if own && let Some(pos) = timeline::position_of(&state.messages, &id) {
                let phase = own_phase(&state.messages[pos]);
                state.phases.insert(id, phase);
            }
        }
        let snapshot = if changed == 0 {
            None
        } else {
            self.ctx
                .cache
                .save(&self.conversation, state.messages.clone())
                .await;
            Some(state.messages.clone())
        };
        drop(state);

        if let Some(oldest) = oldest {
            self.cursor.lock().await.note_newest_page(oldest, joined);
        }
        let Some(snapshot) = snapshot else {
            return Ok(0);
        };

        tracing::debug!(conversation = %self.conversation, changed, "refreshed newest page");
        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Refresh,
        });
        self.note_cache_health();
        Ok(changed)
    }

    pub(super) async fn mark_read(&self, message_id: &MessageId) -> Result<bool, SyncError> {
        let mut state = self.state.lock().await;
        let pos = timeline::position_of(&state.messages, message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
        if state.messages[pos].sender_id == self.ctx.local_user {
            return Ok(false);
        }
        if !self.tracker.mark_read(message_id, &self.ctx.local_user) {
            return Ok(false);
        }
        let message = &mut state.messages[pos];
        message.merge_delivery(&self.tracker.states(message_id));
        let updated = message.clone();
        self.ctx.cache.append(&self.conversation, updated).await;
        let snapshot = state.messages.clone();
        drop(state);

        self.emit(SyncEvent::MessagesChanged {
            messages: snapshot,
            origin: ChangeOrigin::Live,
        });
        self.ctx
            .remote
            .update_delivery_status(message_id, &self.ctx.local_user, DeliveryState::Read)
            .await?;
        Ok(true)
    }

    pub(super) async fn mark_all_read(&self) -> usize {
        let unread: Vec<MessageId> = {
            let state = self.state.lock().await;
            state
                .messages
                .iter()
                .filter(|m| m.sender_id != self.ctx.local_user)
                .filter(|m| {
                    self.tracker.state(&m.id, &self.ctx.local_user) != Some(DeliveryState::Read)
                })
                .map(|m| m.id.clone())
                .collect()
        };

        let mut marked = 0;
        for id in unread {
            match self.mark_read(&id).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    // The local state is already updated; the remote catches
                    // up on the next receipt.
                    tracing::warn!(message_id = %id, error = %e, "failed to report read receipt");
                    marked += 1;
                }
            }
        }
        marked
    }
}

/// Whether `message` is the stored copy of a send still pending in the
/// view. The queue's confirmation replaces the temporary entry; inserting
/// the copy now would show the message twice.
fn awaits_confirmation(state: &ViewState, message: &Message) -> bool {
    timeline::position_of(&state.messages, &message.id).is_none()
        && state.messages.iter().any(|m| {
            m.id.is_temporary()
                && m.content == message.content
                && state.phases.get(&m.id).is_some_and(MessagePhase::is_pending)
        })
}
