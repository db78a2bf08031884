//! Integration tests for the durable outbound queue.
//!
//! Covers:
//! 1. Enqueue is idempotent per temporary id.
//! 2. Queued messages survive a restart, in order.
//! 3. Reconnecting flushes in enqueue order and resolves cache entries.
//! 4. Retryable failures block the head and retry; terminal ones drop it.
//! 5. At most one send is in flight, and every subscriber sees every event.

use std::sync::Arc;
use std::time::Duration;

use chatsync::cache::LocalCacheStore;
use chatsync::config::SyncConfig;
use chatsync::queue::{OutboundQueueHandle, QueueEvent};
use chatsync::remote::loopback::LoopbackRemote;
use chatsync::remote::{Connectivity, RemoteError, RemoteStore};
use chatsync::store::MemoryStore;
use chatsync_proto::message::{
    ConversationId, DeliveryState, Message, MessageContent, MessageId, PendingMessage, Timestamp,
    UserId,
};

use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Cache = LocalCacheStore<Arc<MemoryStore>>;

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        send_timeout: Duration::from_millis(500),
        ..SyncConfig::default()
    }
}

fn outgoing(text: &str, at: u64) -> Message {
    Message::outgoing(
        conv(),
        UserId::new("alice"),
        MessageContent::Text(text.to_string()),
        Timestamp::from_millis(at),
    )
}

struct Fixture {
    store: Arc<MemoryStore>,
    cache: Arc<Cache>,
    remote: Arc<LoopbackRemote>,
    connectivity: Connectivity,
    queue: OutboundQueueHandle,
}

async fn fixture(store: Arc<MemoryStore>, online: bool) -> Fixture {
    let (cache, _warnings) = LocalCacheStore::new(Arc::clone(&store), 50, 4);
    let cache = Arc::new(cache);
    let remote = Arc::new(LoopbackRemote::new());
    let connectivity = Connectivity::new(online);
    let queue = OutboundQueueHandle::spawn(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&remote),
        &connectivity,
        &fast_config(),
    )
    .await
    .unwrap();
    Fixture {
        store,
        cache,
        remote,
        connectivity,
        queue,
    }
}

/// Queues a message the way the coordinator does: cache first, then queue.
async fn queue_message(f: &Fixture, message: Message) {
    f.cache.append(&conv(), message.clone()).await;
    assert!(f.queue.enqueue(PendingMessage::new(message)).await.unwrap());
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> QueueEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for queue event")
        .expect("queue event channel closed")
}

async fn wait_drained(f: &Fixture) {
    let mut depth = f.queue.depth_watch();
    tokio::time::timeout(WAIT, depth.wait_for(|d| *d == 0))
        .await
        .expect("queue did not drain")
        .unwrap();
}

fn texts(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Voice { url, .. } => url.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_ignores_duplicate_ids() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let pending = PendingMessage::new(outgoing("hello", 10));

    assert!(f.queue.enqueue(pending.clone()).await.unwrap());
    assert!(!f.queue.enqueue(pending).await.unwrap());
    assert_eq!(f.queue.peek_depth(), 1);
    assert_eq!(f.queue.dequeue_all().await.unwrap().len(), 1);

    f.connectivity.set_online(true);
    wait_drained(&f).await;
    assert_eq!(f.remote.send_attempts(), 1);
    assert_eq!(texts(&f.remote.stored(&conv())), ["hello"]);
}

#[tokio::test]
async fn dequeue_all_does_not_drain() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    queue_message(&f, outgoing("one", 10)).await;

    assert_eq!(f.queue.dequeue_all().await.unwrap().len(), 1);
    assert_eq!(f.queue.dequeue_all().await.unwrap().len(), 1);
    assert_eq!(f.queue.peek_depth(), 1);
}

#[tokio::test]
async fn queue_survives_restart_in_order() {
    let store = Arc::new(MemoryStore::new());
    let first = fixture(Arc::clone(&store), false).await;
    let messages = [outgoing("a", 10), outgoing("b", 20), outgoing("c", 30)];
    for message in &messages {
        queue_message(&first, message.clone()).await;
    }
    first.queue.shutdown().await.unwrap();

    let second = fixture(store, false).await;
    let restored = second.queue.dequeue_all().await.unwrap();
    let ids: Vec<_> = restored.iter().map(|p| p.id().clone()).collect();
    let expected: Vec<_> = messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, expected);
    assert_eq!(second.queue.peek_depth(), 3);
    assert!(!second.store.is_empty());
}

#[tokio::test]
async fn restored_queue_flushes_when_started_online() {
    let store = Arc::new(MemoryStore::new());
    let first = fixture(Arc::clone(&store), false).await;
    queue_message(&first, outgoing("left over", 10)).await;
    first.queue.shutdown().await.unwrap();

    let second = fixture(store, true).await;
    let mut depth = second.queue.depth_watch();
    tokio::time::timeout(WAIT, depth.wait_for(|d| *d == 0))
        .await
        .expect("queue did not drain")
        .unwrap();
    assert_eq!(texts(&second.remote.stored(&conv())), ["left over"]);
}

#[tokio::test]
async fn reconnect_flushes_in_order_and_resolves_cache() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    for (i, text) in ["first", "second", "third"].iter().enumerate() {
        queue_message(&f, outgoing(text, 10 * (i as u64 + 1))).await;
    }
    assert_eq!(f.remote.send_attempts(), 0);

    f.connectivity.set_online(true);
    let mut confirmed = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events).await {
            QueueEvent::Confirmed {
                temporary_id,
                message,
            } => {
                assert!(temporary_id.is_temporary());
                assert!(!message.id.is_temporary());
                confirmed.push(message);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(texts(&confirmed), ["first", "second", "third"]);
    assert_eq!(
        texts(&f.remote.stored(&conv())),
        ["first", "second", "third"]
    );
    let cached = f.cache.load(&conv()).await;
    assert_eq!(cached.len(), 3);
    assert!(cached.iter().all(|m| !m.id.is_temporary()));
    assert_eq!(cached[0].id.as_str(), "srv_1");
    assert_eq!(f.queue.peek_depth(), 0);
}

#[tokio::test]
async fn retryable_failure_blocks_head_then_retries() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    let head = outgoing("head", 10);
    let tail = outgoing("tail", 20);
    queue_message(&f, head.clone()).await;
    queue_message(&f, tail.clone()).await;
    f.remote
        .fail_next_sends([RemoteError::Unavailable("flaky".into())]);

    f.connectivity.set_online(true);

    match next_event(&mut events).await {
        QueueEvent::Retrying { id, attempt, .. } => {
            assert_eq!(id, head.id);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected retry, got {other:?}"),
    }
    // Nothing left the queue.
    assert_eq!(f.queue.peek_depth(), 2);
    // The tail waits behind the head.
    assert_eq!(next_event(&mut events).await.id(), &head.id);
    assert_eq!(next_event(&mut events).await.id(), &tail.id);
    assert_eq!(texts(&f.remote.stored(&conv())), ["head", "tail"]);
    assert_eq!(f.remote.send_attempts(), 3);
}

#[tokio::test]
async fn terminal_failure_drops_entry_and_continues() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    let rejected = outgoing("rejected", 10);
    let accepted = outgoing("accepted", 20);
    queue_message(&f, rejected.clone()).await;
    queue_message(&f, accepted.clone()).await;
    f.remote
        .fail_next_sends([RemoteError::Malformed("bad payload".into())]);

    f.connectivity.set_online(true);

    match next_event(&mut events).await {
        QueueEvent::Failed {
            id,
            conversation,
            error,
        } => {
            assert_eq!(id, rejected.id);
            assert_eq!(conversation, conv());
            assert!(!error.is_retryable());
        }
        other => panic!("expected failure, got {other:?}"),
    }
    match next_event(&mut events).await {
        QueueEvent::Confirmed { temporary_id, .. } => assert_eq!(temporary_id, accepted.id),
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert_eq!(f.queue.peek_depth(), 0);
    // The rejected message stays cached under its temporary id.
    assert!(
        f.cache
            .load(&conv())
            .await
            .iter()
            .any(|m| m.id == rejected.id)
    );
}

#[tokio::test]
async fn slow_send_times_out_and_is_retried() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    let message = outgoing("slow", 10);
    queue_message(&f, message.clone()).await;
    f.remote.set_send_delay(Some(Duration::from_secs(2)));

    f.connectivity.set_online(true);
    match next_event(&mut events).await {
        QueueEvent::Retrying { id, .. } => assert_eq!(id, message.id),
        other => panic!("expected retry, got {other:?}"),
    }
    f.remote.set_send_delay(None);

    loop {
        if let QueueEvent::Confirmed { temporary_id, .. } = next_event(&mut events).await {
            assert_eq!(temporary_id, message.id);
            break;
        }
    }
    assert_eq!(f.remote.stored(&conv()).len(), 1);
}

#[tokio::test]
async fn remove_drops_a_queued_entry() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let message = outgoing("never mind", 10);
    queue_message(&f, message.clone()).await;

    assert!(f.queue.remove(&message.id).await.unwrap());
    assert!(!f.queue.remove(&message.id).await.unwrap());
    assert_eq!(f.queue.peek_depth(), 0);

    f.connectivity.set_online(true);
    f.queue.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.remote.send_attempts(), 0);
}

#[tokio::test]
async fn shutdown_closes_handles() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    f.queue.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.queue.enqueue(PendingMessage::new(outgoing("late", 10))).await.is_err());
}

#[tokio::test]
async fn flush_requests_during_a_send_are_absorbed() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    for (i, text) in ["a", "b", "c"].iter().enumerate() {
        queue_message(&f, outgoing(text, 10 * (i as u64 + 1))).await;
    }
    f.remote.set_send_delay(Some(Duration::from_millis(30)));

    f.connectivity.set_online(true);
    for _ in 0..5 {
        f.queue.flush().await.unwrap();
        f.connectivity.set_online(false);
        f.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_drained(&f).await;
    assert_eq!(f.remote.send_attempts(), 3);
    assert_eq!(texts(&f.remote.stored(&conv())), ["a", "b", "c"]);
}

#[tokio::test]
async fn idle_subscriber_still_receives_every_confirmation() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    let count = 3 * SyncConfig::default().event_buffer;
    for n in 0..count {
        f.queue
            .enqueue(PendingMessage::new(outgoing(&format!("m{n}"), n as u64)))
            .await
            .unwrap();
    }

    f.connectivity.set_online(true);
    wait_drained(&f).await;

    // Start reading only after every send went through.
    let mut confirmed = Vec::new();
    while confirmed.len() < count {
        if let QueueEvent::Confirmed { message, .. } = next_event(&mut events).await {
            confirmed.push(message);
        }
    }
    assert_eq!(texts(&confirmed[..3]), ["m0", "m1", "m2"]);
}

#[tokio::test]
async fn shutdown_ends_subscriptions() {
    let f = fixture(Arc::new(MemoryStore::new()), false).await;
    let mut events = f.queue.subscribe();
    f.queue.shutdown().await.unwrap();
    let ended = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(ended.is_none());
}

/// Accepts every send but answers with an id from the local namespace.
struct TemporaryIdRemote;

impl RemoteStore for TemporaryIdRemote {
    async fn fetch_messages(
        &self,
        _conversation: &ConversationId,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<Message>, RemoteError> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &MessageContent,
    ) -> Result<Message, RemoteError> {
        let mut stored = Message::outgoing(
            conversation.clone(),
            sender.clone(),
            content.clone(),
            Timestamp::from_millis(99),
        );
        stored.id = MessageId::new("tmp_from_server");
        Ok(stored)
    }

    async fn update_delivery_status(
        &self,
        _message_id: &MessageId,
        _recipient: &UserId,
        _state: DeliveryState,
    ) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn participants(&self, _conversation: &ConversationId) -> Result<Vec<UserId>, RemoteError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn confirmation_with_a_temporary_id_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (cache, _warnings) = LocalCacheStore::new(Arc::clone(&store), 50, 4);
    let cache = Arc::new(cache);
    let connectivity = Connectivity::new(false);
    let queue = OutboundQueueHandle::spawn(
        store,
        Arc::clone(&cache),
        Arc::new(TemporaryIdRemote),
        &connectivity,
        &fast_config(),
    )
    .await
    .unwrap();
    let mut events = queue.subscribe();
    let message = outgoing("hello", 10);
    cache.append(&conv(), message.clone()).await;
    queue.enqueue(PendingMessage::new(message.clone())).await.unwrap();

    connectivity.set_online(true);
    match next_event(&mut events).await {
        QueueEvent::Failed { id, error, .. } => {
            assert_eq!(id, message.id);
            assert!(matches!(error, RemoteError::Malformed(_)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(queue.peek_depth(), 0);
    assert_eq!(cache.load(&conv()).await, vec![message]);
}
