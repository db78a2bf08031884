//! Durable key-value persistence used by the cache and the outbound queue.
//!
//! Defines the [`KeyValueStore`] trait plus two implementations:
//! - [`MemoryStore`]: process-local map, used by tests and as a stand-in
//!   when no data directory is configured
//! - [`file::FileStore`]: one file per key under a data directory

pub mod file;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Errors that can occur during key-value storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A stored payload could not be decoded.
    #[error("corrupt payload under {key}: {source}")]
    Corrupt {
        /// Key whose payload is unreadable.
        key: String,
        /// Decoder error.
        source: chatsync_proto::codec::CodecError,
    },
}

/// Generic get/set/remove persistence keyed by string.
///
/// Values are opaque bytes; callers encode them with
/// [`chatsync_proto::codec`].
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Removes the value under `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

impl<S: KeyValueStore> KeyValueStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.as_ref().set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.as_ref().remove(key).await
    }
}

/// In-memory implementation of [`KeyValueStore`].
///
/// Not persistent across processes. Sharing one instance behind an `Arc`
/// between two cache or queue instances simulates a process restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
