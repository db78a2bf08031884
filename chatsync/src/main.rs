//! `chatsync`: command-line front end for the synchronization core.
//!
//! Runs a scripted offline/online session against an in-process remote, or
//! prints what a data directory holds. Configuration via CLI flags,
//! environment variables, or config file
//! (`~/.config/chatsync/config.toml`).
//!
//! ```bash
//! # Scripted session; cache and queue land in the data dir
//! cargo run --bin chatsync -- --user-id alice demo
//!
//! # Inspect the cached timeline and pending sends
//! cargo run --bin chatsync -- inspect general --json
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::cache::{CacheWarning, LocalCacheStore};
use chatsync::config::{CliArgs, ClientConfig, Command};
use chatsync::queue::OutboundQueueHandle;
use chatsync::remote::loopback::{LoopbackProcessor, LoopbackRemote};
use chatsync::remote::{Connectivity, compose_voice};
use chatsync::store::file::FileStore;
use chatsync::sync::{Coordinator, SyncContext, SyncEvent};
use chatsync_proto::message::{
    ConversationId, Message, MessageContent, MessageId, Timestamp, UserId,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Conversation used by the demo session.
const DEMO_CONVERSATION: &str = "general";

/// Peer that talks to the local user in the demo session.
const DEMO_PEER: &str = "bob";

/// How long the demo waits for the queue to drain after reconnecting.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // CLI args > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(user = %config.user_id, data_dir = %config.data_dir.display(), "chatsync starting");

    let result = match cli.command.clone().unwrap_or(Command::Demo) {
        Command::Demo => run_demo(&config).await,
        Command::Inspect { conversation, json } => {
            run_inspect(&config, &ConversationId::new(conversation), json).await
        }
    };

    match result {
        Ok(()) => {
            tracing::info!("chatsync exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "chatsync failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the printed timeline.
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Scripted session:
/// 1. A peer message arrives over the live stream
/// 2. The client goes offline and sends two messages
/// 3. The client comes back online and the queue drains
/// 4. Everything from the peer is marked read
async fn run_demo(config: &ClientConfig) -> Result<(), BoxError> {
    let sync = config.sync_config();
    let store = FileStore::open(&config.data_dir).await?;
    let (cache, warnings) = LocalCacheStore::new(store.clone(), sync.cache_capacity, 8);
    tokio::spawn(log_cache_warnings(warnings));
    let cache = Arc::new(cache);

    let conversation = ConversationId::new(DEMO_CONVERSATION);
    let local_user = UserId::new(config.user_id.clone());
    let peer = UserId::new(DEMO_PEER);

    let remote = Arc::new(LoopbackRemote::new());
    remote.set_participants(&conversation, vec![local_user.clone(), peer.clone()]);
    let connectivity = Connectivity::new(true);
    let queue = OutboundQueueHandle::spawn(
        store,
        Arc::clone(&cache),
        Arc::clone(&remote),
        &connectivity,
        &sync,
    )
    .await?;

    let ctx = SyncContext {
        local_user,
        cache,
        remote: Arc::clone(&remote),
        live: Arc::clone(&remote),
        queue: queue.clone(),
        connectivity: connectivity.clone(),
        config: sync,
    };
    let (coordinator, events) = Coordinator::open(&ctx, conversation.clone()).await?;
    let printer = tokio::spawn(print_events(events));

    let now = Timestamp::now();
    remote.publish_incoming(Message {
        id: MessageId::new(format!("peer_{}", now.as_millis())),
        conversation_id: conversation.clone(),
        sender_id: peer,
        content: MessageContent::Text("are you around?".to_string()),
        created_at: now,
        edited_at: None,
        delivery_by_recipient: BTreeMap::new(),
    });

    println!("-- going offline");
    remote.set_online(false);
    connectivity.set_online(false);
    coordinator.send_text("on the train, spotty signal").await?;
    let voice = compose_voice(&LoopbackProcessor, "https://media.invalid/clip-1.ogg", 4).await;
    coordinator.send(voice).await?;
    println!("   queued: {}", coordinator.queue_depth());

    println!("-- back online");
    remote.set_online(true);
    connectivity.set_online(true);
    let mut depth = queue.depth_watch();
    if tokio::time::timeout(DRAIN_TIMEOUT, depth.wait_for(|d| *d == 0))
        .await
        .is_err()
    {
        println!("   queue still holds {} message(s)", queue.peek_depth());
    }

    let read = coordinator.mark_all_read().await;
    println!("   marked {read} message(s) read");

    println!("-- timeline of {conversation}");
    for message in coordinator.messages().await {
        println!("   {}", format_line(&message));
    }

    coordinator.close().await;
    drop(coordinator);
    queue.shutdown().await?;
    printer.abort();
    Ok(())
}

/// Prints the cached timeline and the pending outbound queue.
async fn run_inspect(
    config: &ClientConfig,
    conversation: &ConversationId,
    json: bool,
) -> Result<(), BoxError> {
    let sync = config.sync_config();
    let store = FileStore::open(&config.data_dir).await?;
    let (cache, warnings) = LocalCacheStore::new(store.clone(), sync.cache_capacity, 8);
    tokio::spawn(log_cache_warnings(warnings));
    let cache = Arc::new(cache);

    // Offline, so restoring the queue never triggers a send.
    let queue = OutboundQueueHandle::spawn(
        store,
        Arc::clone(&cache),
        Arc::new(LoopbackRemote::new()),
        &Connectivity::new(false),
        &sync,
    )
    .await?;
    let messages = cache.load(conversation).await;
    let pending = queue.dequeue_all().await?;
    queue.shutdown().await?;

    if json {
        let report = serde_json::json!({
            "conversation": conversation,
            "messages": messages,
            "pending": pending,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{} cached message(s) in {conversation}", messages.len());
    for message in &messages {
        println!("  {}", format_line(message));
    }
    println!("{} pending send(s)", pending.len());
    for entry in &pending {
        println!(
            "  {} -> {} (attempt {})",
            entry.id(),
            entry.conversation_id(),
            entry.attempt
        );
    }
    Ok(())
}

fn format_line(message: &Message) -> String {
    let millis = i64::try_from(message.created_at.as_millis()).unwrap_or(i64::MAX);
    let time = chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| "--:--:--".to_string(), |t| t.format("%H:%M:%S").to_string());
    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Voice {
            duration_secs,
            transcript,
            ..
        } => match transcript {
            Some(t) => format!("[voice {duration_secs}s] {t}"),
            None => format!("[voice {duration_secs}s]"),
        },
    };
    let status = if message.id.is_temporary() {
        "pending".to_string()
    } else {
        message
            .delivery_by_recipient
            .values()
            .max()
            .map_or_else(|| "sent".to_string(), ToString::to_string)
    };
    format!("{time} <{}> {body} ({status})", message.sender_id)
}

async fn print_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::IdResolved {
                temporary_id,
                confirmed_id,
            } => println!("   confirmed {temporary_id} as {confirmed_id}"),
            SyncEvent::SendFailed { id, error } => println!("   send of {id} failed: {error}"),
            SyncEvent::ConnectionChanged { connected } => {
                println!("   connection {}", if connected { "up" } else { "down" });
            }
            SyncEvent::RefreshFailed { error } => println!("   refresh failed: {error}"),
            SyncEvent::CacheDegraded => println!("   cache is running in memory only"),
            other => tracing::trace!(event = ?other, "sync event"),
        }
    }
}

async fn log_cache_warnings(mut warnings: mpsc::Receiver<CacheWarning>) {
    while let Some(warning) = warnings.recv().await {
        tracing::warn!(warning = ?warning, "cache warning");
    }
}
