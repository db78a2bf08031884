//! `chatsync`: offline-first chat synchronization core.
//!
//! Keeps a per-conversation, ordered and deduplicated message view
//! consistent across a bounded local cache, a remote message store, a live
//! push stream and a durable outbound queue. Start with
//! [`sync::Coordinator::open`].

pub mod cache;
pub mod config;
pub mod delivery;
pub mod lifecycle;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod timeline;
