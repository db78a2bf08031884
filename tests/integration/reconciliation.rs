//! Integration tests for the per-conversation coordinator.
//!
//! Verifies that the view stays ordered and duplicate-free across
//! optimistic sends, id resolution, live events, receipts, restarts and
//! cache failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatsync::cache::LocalCacheStore;
use chatsync::config::SyncConfig;
use chatsync::lifecycle::MessagePhase;
use chatsync::queue::OutboundQueueHandle;
use chatsync::remote::loopback::LoopbackRemote;
use chatsync::remote::{Connectivity, RemoteError};
use chatsync::store::{KeyValueStore, MemoryStore, StoreError};
use chatsync::sync::{
    ChangeOrigin, Coordinator, Reconciliation, Resolution, SyncContext, SyncError, SyncEvent,
};
use chatsync_proto::event::LiveEvent;
use chatsync_proto::message::{
    ConversationId, DeliveryState, Message, MessageContent, MessageId, Timestamp, UserId,
};

use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A store that can be switched into failing every call.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("disk full".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(key).await
    }
}

type Ctx = SyncContext<Arc<FlakyStore>, LoopbackRemote, LoopbackRemote>;
type Coord = Coordinator<Arc<FlakyStore>, LoopbackRemote, LoopbackRemote>;

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

fn me() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn incoming(id: &str, text: &str, at: u64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: conv(),
        sender_id: bob(),
        content: MessageContent::Text(text.to_string()),
        created_at: Timestamp::from_millis(at),
        edited_at: None,
        delivery_by_recipient: BTreeMap::new(),
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    remote: Arc<LoopbackRemote>,
    connectivity: Connectivity,
    ctx: Ctx,
}

async fn harness(store: Arc<FlakyStore>, online: bool) -> Harness {
    harness_with(store, online, 512).await
}

async fn harness_with(store: Arc<FlakyStore>, online: bool, event_buffer: usize) -> Harness {
    let config = SyncConfig {
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        event_buffer,
        ..SyncConfig::default()
    };
    let (cache, _warnings) = LocalCacheStore::new(Arc::clone(&store), config.cache_capacity, 4);
    let cache = Arc::new(cache);
    let remote = Arc::new(LoopbackRemote::new());
    remote.set_participants(&conv(), vec![me(), bob()]);
    let connectivity = Connectivity::new(online);
    let queue = OutboundQueueHandle::spawn(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&remote),
        &connectivity,
        &config,
    )
    .await
    .unwrap();
    let ctx = SyncContext {
        local_user: me(),
        cache,
        remote: Arc::clone(&remote),
        live: Arc::clone(&remote),
        queue,
        connectivity: connectivity.clone(),
        config,
    };
    Harness {
        store,
        remote,
        connectivity,
        ctx,
    }
}

async fn open(h: &Harness) -> (Coord, mpsc::Receiver<SyncEvent>) {
    Coordinator::open(&h.ctx, conv()).await.unwrap()
}

/// Receives events until one matches.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    mut matches: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

/// Waits until `temporary_id` is replaced and returns the confirmed id.
async fn wait_confirmed(
    events: &mut mpsc::Receiver<SyncEvent>,
    temporary_id: &MessageId,
) -> MessageId {
    match wait_for(
        events,
        |e| matches!(e, SyncEvent::IdResolved { temporary_id: t, .. } if t == temporary_id),
    )
    .await
    {
        SyncEvent::IdResolved { confirmed_id, .. } => confirmed_id,
        _ => unreachable!(),
    }
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Live reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_message_lands_between_its_neighbors() {
    let h = harness(Arc::default(), true).await;
    h.remote.publish_incoming(incoming("m1", "one", 10));
    h.remote.publish_incoming(incoming("m3", "three", 30));
    let (coordinator, _events) = open(&h).await;
    assert_eq!(ids(&coordinator.messages().await), ["m1", "m3"]);

    let outcome = coordinator
        .handle_live_event(LiveEvent::Inserted(incoming("m2", "two", 20)))
        .await;
    assert_eq!(outcome, Reconciliation::Inserted);

    let messages = coordinator.messages().await;
    assert_eq!(ids(&messages), ["m1", "m2", "m3"]);
    assert_eq!(
        messages[1].delivery_by_recipient.get(&me()),
        Some(&DeliveryState::Delivered)
    );
}

#[tokio::test]
async fn live_stream_feeds_the_view() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, mut events) = open(&h).await;

    h.remote.publish_incoming(incoming("m1", "hello", 10));
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::MessagesChanged { origin: ChangeOrigin::Live, messages } if messages.len() == 1)
    })
    .await;
    assert_eq!(ids(&coordinator.messages().await), ["m1"]);
}

#[tokio::test]
async fn events_for_other_conversations_are_ignored() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, _events) = open(&h).await;

    let mut elsewhere = incoming("x1", "wrong room", 10);
    elsewhere.conversation_id = ConversationId::new("c2");
    let outcome = coordinator
        .handle_live_event(LiveEvent::Inserted(elsewhere))
        .await;
    assert_eq!(outcome, Reconciliation::Unchanged);
    assert!(coordinator.messages().await.is_empty());
}

#[tokio::test]
async fn newer_edit_wins_and_stale_edit_is_ignored() {
    let h = harness(Arc::default(), true).await;
    h.remote.publish_incoming(incoming("m1", "draft", 10));
    let (coordinator, _events) = open(&h).await;

    let mut edited = incoming("m1", "final", 10);
    edited.edited_at = Some(Timestamp::from_millis(20));
    assert_eq!(
        coordinator
            .handle_live_event(LiveEvent::Updated(edited))
            .await,
        Reconciliation::Updated
    );

    let mut stale = incoming("m1", "stale", 10);
    stale.edited_at = Some(Timestamp::from_millis(15));
    assert_eq!(
        coordinator.handle_live_event(LiveEvent::Updated(stale)).await,
        Reconciliation::Unchanged
    );

    let messages = coordinator.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, MessageContent::Text("final".into()));
}

// ---------------------------------------------------------------------------
// Optimistic sends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn own_echo_never_duplicates_a_send() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, mut events) = open(&h).await;

    let temporary = coordinator.send_text("hi there").await.unwrap();
    assert!(temporary.is_temporary());
    let confirmed = wait_confirmed(&mut events, &temporary).await;

    // A late echo of the confirmed message changes nothing.
    let echo = h.remote.stored(&conv()).remove(0);
    assert_eq!(echo.id, confirmed);
    assert_eq!(
        coordinator.handle_live_event(LiveEvent::Inserted(echo)).await,
        Reconciliation::Unchanged
    );

    let messages = coordinator.messages().await;
    assert_eq!(ids(&messages), [confirmed.as_str()]);
    assert_eq!(
        coordinator.resolution(&temporary).await,
        Some(Resolution::Confirmed(confirmed.clone()))
    );
    assert_eq!(coordinator.phase(&confirmed).await, Some(MessagePhase::Sent));
    assert_eq!(coordinator.phase(&temporary).await, None);
}

#[tokio::test]
async fn unknown_own_message_is_discarded_as_echo() {
    let h = harness(Arc::default(), false).await;
    let (coordinator, _events) = open(&h).await;

    let mut echo = incoming("srv_42", "sent elsewhere", 10);
    echo.sender_id = me();
    assert_eq!(
        coordinator.handle_live_event(LiveEvent::Inserted(echo)).await,
        Reconciliation::OwnEcho
    );
    assert!(coordinator.messages().await.is_empty());
}

#[tokio::test]
async fn remote_ids_in_the_temporary_namespace_are_ignored() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, _events) = open(&h).await;

    let impostor = incoming("tmp_from_server", "hi", 10);
    assert_eq!(
        coordinator
            .handle_live_event(LiveEvent::Inserted(impostor.clone()))
            .await,
        Reconciliation::Unchanged
    );
    h.remote.publish_incoming(impostor);
    assert_eq!(coordinator.refresh().await.unwrap(), 0);
    assert!(coordinator.messages().await.is_empty());
    assert!(h.ctx.cache.load(&conv()).await.is_empty());
}

#[tokio::test]
async fn offline_sends_keep_order_and_resolve_on_reconnect() {
    let h = harness(Arc::default(), false).await;
    let (coordinator, mut events) = open(&h).await;

    let first = coordinator.send_text("one").await.unwrap();
    let second = coordinator.send_text("two").await.unwrap();
    let view = coordinator.messages().await;
    assert_eq!(ids(&view), [first.as_str(), second.as_str()]);
    assert!(view[0].created_at < view[1].created_at);
    assert_eq!(
        coordinator.phase(&first).await,
        Some(MessagePhase::Queued { attempt: 0 })
    );
    assert_eq!(coordinator.queue_depth(), 2);

    h.connectivity.set_online(true);
    let first_confirmed = wait_confirmed(&mut events, &first).await;
    let second_confirmed = wait_confirmed(&mut events, &second).await;

    let view = coordinator.messages().await;
    assert_eq!(
        ids(&view),
        [first_confirmed.as_str(), second_confirmed.as_str()]
    );
    let cached = h.ctx.cache.load(&conv()).await;
    assert!(cached.iter().all(|m| !m.id.is_temporary()));
}

#[tokio::test]
async fn slow_confirmations_still_resolve_every_send() {
    let h = harness_with(Arc::default(), false, 4).await;
    // No members and a slow lookup: every confirmation pays for a lookup.
    h.remote.set_participants(&conv(), Vec::new());
    h.remote.set_participants_delay(Some(Duration::from_millis(10)));
    let (coordinator, _events) = open(&h).await;

    let mut sent = Vec::new();
    for n in 0..40 {
        sent.push(coordinator.send_text(&format!("burst {n}")).await.unwrap());
    }
    h.connectivity.set_online(true);

    tokio::time::timeout(WAIT, async {
        while coordinator
            .messages()
            .await
            .iter()
            .any(|m| m.id.is_temporary())
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("temporary ids stayed in the view");

    assert_eq!(coordinator.messages().await.len(), sent.len());
    assert_eq!(coordinator.queue_depth(), 0);
    for id in &sent {
        assert!(matches!(
            coordinator.resolution(id).await,
            Some(Resolution::Confirmed(_))
        ));
    }
    let cached = h.ctx.cache.load(&conv()).await;
    assert!(cached.iter().all(|m| !m.id.is_temporary()));
}

#[tokio::test]
async fn invalid_content_creates_nothing() {
    let h = harness(Arc::default(), false).await;
    let (coordinator, _events) = open(&h).await;

    let err = coordinator.send_text("   \u{0}  ").await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    let err = coordinator.send_voice("", 3, None).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(coordinator.messages().await.is_empty());
    assert_eq!(coordinator.queue_depth(), 0);
}

#[tokio::test]
async fn rejected_send_fails_and_can_be_retried() {
    let h = harness(Arc::default(), true).await;
    h.remote
        .fail_next_sends([RemoteError::PayloadTooLarge { size: 1 }]);
    let (coordinator, mut events) = open(&h).await;

    let temporary = coordinator.send_text("too big, apparently").await.unwrap();
    wait_for(
        &mut events,
        |e| matches!(e, SyncEvent::SendFailed { id, .. } if id == &temporary),
    )
    .await;
    assert!(matches!(
        coordinator.phase(&temporary).await,
        Some(MessagePhase::Failed { .. })
    ));
    assert!(matches!(
        coordinator.resolution(&temporary).await,
        Some(Resolution::Failed(_))
    ));

    coordinator.retry_failed(&temporary).await.unwrap();
    let confirmed = wait_confirmed(&mut events, &temporary).await;
    assert_eq!(ids(&coordinator.messages().await), [confirmed.as_str()]);
}

#[tokio::test]
async fn retry_requires_a_failed_message() {
    let h = harness(Arc::default(), false).await;
    let (coordinator, _events) = open(&h).await;
    let temporary = coordinator.send_text("waiting").await.unwrap();

    let err = coordinator.retry_failed(&temporary).await.unwrap_err();
    assert!(matches!(err, SyncError::Transition(_)));
    let err = coordinator
        .retry_failed(&MessageId::new("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownMessage(_)));
}

#[tokio::test]
async fn discard_removes_an_unsent_message_everywhere() {
    let h = harness(Arc::default(), false).await;
    let (coordinator, _events) = open(&h).await;
    let temporary = coordinator.send_text("never mind").await.unwrap();

    assert!(coordinator.discard(&temporary).await.unwrap());
    assert!(coordinator.messages().await.is_empty());
    assert_eq!(coordinator.queue_depth(), 0);
    assert!(h.ctx.cache.load(&conv()).await.is_empty());

    let err = coordinator
        .discard(&MessageId::new("srv_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotTemporary(_)));
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receipts_advance_delivery_and_phase() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, mut events) = open(&h).await;
    let temporary = coordinator.send_text("did you get this?").await.unwrap();
    let confirmed = wait_confirmed(&mut events, &temporary).await;

    let summary = coordinator.delivery_summary(&confirmed);
    assert_eq!(summary.total_recipients, 1);
    assert_eq!(summary.delivered_count, 0);

    let receipt = |state| LiveEvent::Receipt {
        message_id: confirmed.clone(),
        recipient: bob(),
        state,
    };
    assert_eq!(
        coordinator
            .handle_live_event(receipt(DeliveryState::Delivered))
            .await,
        Reconciliation::ReceiptApplied
    );
    assert_eq!(
        coordinator.phase(&confirmed).await,
        Some(MessagePhase::Delivered)
    );

    assert_eq!(
        coordinator
            .handle_live_event(receipt(DeliveryState::Read))
            .await,
        Reconciliation::ReceiptApplied
    );
    // Receipts never move backwards.
    assert_eq!(
        coordinator
            .handle_live_event(receipt(DeliveryState::Delivered))
            .await,
        Reconciliation::Unchanged
    );

    assert_eq!(coordinator.phase(&confirmed).await, Some(MessagePhase::Read));
    let summary = coordinator.delivery_summary(&confirmed);
    assert_eq!(summary.read_count, 1);
    assert!(summary.is_read_by_all());
}

#[tokio::test]
async fn receipt_for_unknown_message_is_buffered() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, _events) = open(&h).await;

    let outcome = coordinator
        .handle_live_event(LiveEvent::Receipt {
            message_id: MessageId::new("srv_99"),
            recipient: bob(),
            state: DeliveryState::Read,
        })
        .await;
    assert_eq!(outcome, Reconciliation::ReceiptBuffered);
    assert!(coordinator.messages().await.is_empty());
}

#[tokio::test]
async fn mark_read_reports_to_the_remote() {
    let h = harness(Arc::default(), true).await;
    h.remote.publish_incoming(incoming("m1", "ping", 10));
    h.remote.publish_incoming(incoming("m2", "ping again", 20));
    let (coordinator, _events) = open(&h).await;

    assert!(coordinator.mark_read(&MessageId::new("m1")).await.unwrap());
    assert!(!coordinator.mark_read(&MessageId::new("m1")).await.unwrap());
    assert_eq!(coordinator.mark_all_read().await, 1);
    assert!(matches!(
        coordinator.mark_read(&MessageId::new("zzz")).await,
        Err(SyncError::UnknownMessage(_))
    ));

    let reads: Vec<_> = h
        .remote
        .status_updates()
        .into_iter()
        .filter(|(_, user, state)| user == &me() && *state == DeliveryState::Read)
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(reads, [MessageId::new("m1"), MessageId::new("m2")]);
}

// ---------------------------------------------------------------------------
// Restart, close and degraded storage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_marks_unqueued_temporaries_failed() {
    let store: Arc<FlakyStore> = Arc::default();
    let (orphan, queued) = {
        let h = harness(Arc::clone(&store), false).await;
        let (coordinator, _events) = open(&h).await;
        let orphan = coordinator.send_text("lost").await.unwrap();
        let queued = coordinator.send_text("kept").await.unwrap();
        // Simulate the queue losing one entry before the crash.
        assert!(h.ctx.queue.remove(&orphan).await.unwrap());
        h.ctx.queue.shutdown().await.unwrap();
        (orphan, queued)
    };

    let h = harness(store, false).await;
    let (coordinator, _events) = open(&h).await;
    assert_eq!(coordinator.messages().await.len(), 2);
    assert!(matches!(
        coordinator.phase(&orphan).await,
        Some(MessagePhase::Failed { .. })
    ));
    assert_eq!(
        coordinator.phase(&queued).await,
        Some(MessagePhase::Queued { attempt: 0 })
    );

    coordinator.retry_failed(&orphan).await.unwrap();
    assert_eq!(coordinator.queue_depth(), 2);
    assert_eq!(
        coordinator.phase(&orphan).await,
        Some(MessagePhase::Queued { attempt: 0 })
    );
}

#[tokio::test]
async fn close_stops_live_updates() {
    let h = harness(Arc::default(), true).await;
    let (coordinator, _events) = open(&h).await;
    assert_eq!(h.remote.subscriber_count(&conv()), 1);

    coordinator.close().await;
    assert!(coordinator.is_closed());
    assert_eq!(h.remote.subscriber_count(&conv()), 0);

    h.remote.publish_incoming(incoming("late", "anyone?", 10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.messages().await.is_empty());
    assert!(matches!(
        coordinator.send_text("hello?").await,
        Err(SyncError::Closed)
    ));
}

#[tokio::test]
async fn refresh_failure_keeps_cached_view() {
    let h = harness(Arc::default(), true).await;
    h.remote.publish_incoming(incoming("m1", "cached", 10));
    let (coordinator, mut events) = open(&h).await;
    assert_eq!(coordinator.messages().await.len(), 1);

    h.remote.set_online(false);
    assert!(matches!(
        coordinator.refresh().await,
        Err(SyncError::Remote(RemoteError::Unavailable(_)))
    ));
    wait_for(&mut events, |e| matches!(e, SyncEvent::RefreshFailed { .. })).await;
    assert_eq!(ids(&coordinator.messages().await), ["m1"]);
}

#[tokio::test]
async fn degraded_cache_keeps_working_in_memory() {
    let store: Arc<FlakyStore> = Arc::default();
    let h = harness(Arc::clone(&store), false).await;
    h.store.fail();

    let (coordinator, mut events) = open(&h).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::CacheDegraded)).await;
    assert!(h.ctx.cache.is_degraded());

    let temporary = coordinator.send_text("still works").await.unwrap();
    assert_eq!(ids(&coordinator.messages().await), [temporary.as_str()]);
    assert_eq!(h.ctx.cache.load(&conv()).await.len(), 1);
    assert_eq!(coordinator.queue_depth(), 1);
}
