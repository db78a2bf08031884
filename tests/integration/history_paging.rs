//! Integration tests for loading older history through the coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chatsync::cache::LocalCacheStore;
use chatsync::config::SyncConfig;
use chatsync::queue::OutboundQueueHandle;
use chatsync::remote::loopback::LoopbackRemote;
use chatsync::remote::{Connectivity, RemoteError};
use chatsync::store::MemoryStore;
use chatsync::sync::pagination::{PageSource, PaginationError};
use chatsync::sync::{ChangeOrigin, Coordinator, SyncContext, SyncError, SyncEvent};
use chatsync_proto::message::{
    ConversationId, Message, MessageContent, MessageId, Timestamp, UserId,
};

type Ctx = SyncContext<Arc<MemoryStore>, LoopbackRemote, LoopbackRemote>;

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

fn message(n: u64) -> Message {
    Message {
        id: MessageId::new(format!("m{n}")),
        conversation_id: conv(),
        sender_id: UserId::new("bob"),
        content: MessageContent::Text(format!("message {n}")),
        created_at: Timestamp::from_millis(n * 10),
        edited_at: None,
        delivery_by_recipient: BTreeMap::new(),
    }
}

/// A remote holding `count` messages and a context paging by `page_size`.
async fn context(store: Arc<MemoryStore>, count: u64, page_size: usize) -> (Ctx, Arc<LoopbackRemote>) {
    let config = SyncConfig {
        page_size,
        event_buffer: 512,
        ..SyncConfig::default()
    };
    let (cache, _warnings) = LocalCacheStore::new(Arc::clone(&store), config.cache_capacity, 4);
    let cache = Arc::new(cache);
    let remote = Arc::new(LoopbackRemote::new());
    for n in 1..=count {
        remote.publish_incoming(message(n));
    }
    let connectivity = Connectivity::new(true);
    let queue = OutboundQueueHandle::spawn(
        store,
        Arc::clone(&cache),
        Arc::clone(&remote),
        &connectivity,
        &config,
    )
    .await
    .unwrap();
    let ctx = SyncContext {
        local_user: UserId::new("alice"),
        cache,
        remote: Arc::clone(&remote),
        live: Arc::clone(&remote),
        queue,
        connectivity,
        config,
    };
    (ctx, remote)
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn pages_walk_back_to_the_start() {
    let (ctx, _remote) = context(Arc::new(MemoryStore::new()), 7, 3).await;
    let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();
    assert_eq!(ids(&coordinator.messages().await), ["m5", "m6", "m7"]);

    let page = coordinator.load_older().await.unwrap();
    assert_eq!(page.source, PageSource::Remote);
    assert_eq!(ids(&page.messages), ["m2", "m3", "m4"]);
    assert!(!page.exhausted);

    let page = coordinator.load_older().await.unwrap();
    assert_eq!(ids(&page.messages), ["m1"]);
    assert!(page.exhausted);

    let page = coordinator.load_older().await.unwrap();
    assert!(page.messages.is_empty());
    assert!(page.exhausted);

    assert_eq!(
        ids(&coordinator.messages().await),
        ["m1", "m2", "m3", "m4", "m5", "m6", "m7"]
    );
}

#[tokio::test]
async fn older_pages_are_backfilled_into_the_cache() {
    let (ctx, remote) = context(Arc::new(MemoryStore::new()), 6, 3).await;
    {
        let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();
        coordinator.load_older().await.unwrap();
        coordinator.close().await;
    }
    assert_eq!(ctx.cache.load(&conv()).await.len(), 6);

    // Offline, a fresh coordinator still shows everything paged so far.
    remote.set_online(false);
    let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();
    assert_eq!(
        ids(&coordinator.messages().await),
        ["m1", "m2", "m3", "m4", "m5", "m6"]
    );
}

#[tokio::test]
async fn history_continues_past_the_cached_view() {
    let (ctx, remote) = context(Arc::new(MemoryStore::new()), 4, 2).await;
    for n in 3..=4 {
        ctx.cache.append(&conv(), message(n)).await;
    }
    remote.set_online(false);
    let (coordinator, mut events) = Coordinator::open(&ctx, conv()).await.unwrap();
    assert_eq!(ids(&coordinator.messages().await), ["m3", "m4"]);

    remote.set_online(true);
    let page = coordinator.load_older().await.unwrap();
    assert_eq!(page.source, PageSource::Remote);
    assert_eq!(ids(&page.messages), ["m1", "m2"]);
    assert_eq!(
        ids(&coordinator.messages().await),
        ["m1", "m2", "m3", "m4"]
    );

    let mut saw_history = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            SyncEvent::MessagesChanged {
                origin: ChangeOrigin::History,
                ..
            }
        ) {
            saw_history = true;
        }
    }
    assert!(saw_history);
}

#[tokio::test]
async fn gap_between_cache_and_newest_page_is_loaded() {
    let (ctx, _remote) = context(Arc::new(MemoryStore::new()), 12, 3).await;
    // Left over from an earlier session: the oldest three only.
    for n in 1..=3 {
        ctx.cache.append(&conv(), message(n)).await;
    }
    let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();
    assert_eq!(
        ids(&coordinator.messages().await),
        ["m1", "m2", "m3", "m10", "m11", "m12"]
    );

    let page = coordinator.load_older().await.unwrap();
    assert_eq!(page.source, PageSource::Remote);
    assert_eq!(ids(&page.messages), ["m7", "m8", "m9"]);

    let mut exhausted = page.exhausted;
    for _ in 0..10 {
        if exhausted {
            break;
        }
        exhausted = coordinator.load_older().await.unwrap().exhausted;
    }
    assert!(exhausted);
    let expected: Vec<String> = (1..=12).map(|n| format!("m{n}")).collect();
    assert_eq!(ids(&coordinator.messages().await), expected);
}

#[tokio::test]
async fn remote_failure_surfaces_as_pagination_error() {
    let (ctx, remote) = context(Arc::new(MemoryStore::new()), 5, 2).await;
    let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();

    remote.set_online(false);
    let err = coordinator.load_older().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Pagination(PaginationError::Remote(RemoteError::Unavailable(_)))
    ));
    assert_eq!(ids(&coordinator.messages().await), ["m4", "m5"]);
}

#[tokio::test]
async fn closed_coordinator_refuses_to_page() {
    let (ctx, _remote) = context(Arc::new(MemoryStore::new()), 5, 2).await;
    let (coordinator, _events) = Coordinator::open(&ctx, conv()).await.unwrap();
    coordinator.close().await;
    assert!(matches!(
        coordinator.load_older().await,
        Err(SyncError::Closed)
    ));
}
