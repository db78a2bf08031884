//! Loading older history, cache first.
//!
//! Each call yields one page older than what the caller holds: cached
//! messages while the cache has any the caller lacks, then remote pages
//! fetched by offset. A remote page shorter than the page size ends the
//! history.
//!
//! The remote offset is derived from a frontier: the oldest message reached
//! by walking the remote newest-first without skipping anything. Held
//! messages older than the frontier (a cache left over from an earlier
//! session) do not count towards the offset, so a gap between them and the
//! newest page is fetched rather than jumped over.

use std::collections::HashSet;

use tokio::sync::watch;

use chatsync_proto::message::{ConversationId, Message, MessageId, Timestamp};

use crate::cache::LocalCacheStore;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::KeyValueStore;

/// Upper bound on consecutive remote pages that overlap entirely with
/// what the caller already holds.
const MAX_OVERLAP_SKIPS: usize = 8;

/// Errors returned while loading older history.
#[derive(Debug, thiserror::Error)]
pub enum PaginationError {
    /// The conversation was closed while the page was loading.
    #[error("history load cancelled")]
    Cancelled,

    /// The remote fetch failed.
    #[error("history fetch failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Where a history page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// The local cache.
    Cache,
    /// The remote store.
    Remote,
}

/// One page of older messages, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Messages the caller did not hold yet.
    pub messages: Vec<Message>,
    /// Where they came from.
    pub source: PageSource,
    /// Whether the remote has nothing older.
    pub exhausted: bool,
}

/// What the caller already holds.
#[derive(Debug, Clone, Default)]
pub struct KnownHistory {
    /// `created_at` of the oldest held message.
    pub before: Option<Timestamp>,
    /// Ids of every held message.
    pub ids: HashSet<MessageId>,
    /// `created_at` of every held message with a confirmed id.
    pub confirmed: Vec<Timestamp>,
}

impl KnownHistory {
    /// Number of held confirmed messages created at or after `at`.
    #[must_use]
    pub fn confirmed_since(&self, at: Timestamp) -> usize {
        self.confirmed.iter().filter(|t| **t >= at).count()
    }
}

/// Per-conversation history cursor.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    page_size: usize,
    exhausted: bool,
    /// `created_at` of the oldest message reached contiguously from the
    /// newest remote page. `None` until a remote page has been seen.
    frontier: Option<Timestamp>,
}

impl PaginationCursor {
    /// Creates a cursor yielding pages of `page_size`.
    #[must_use]
    pub const fn new(page_size: usize) -> Self {
        Self {
            page_size,
            exhausted: false,
            frontier: None,
        }
    }

    /// Whether the remote reported the end of history.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Records the newest remote page, as fetched by a refresh.
    ///
    /// `joined` tells whether the page shared an id with what the caller
    /// held before. A page that did not join leaves a gap below it: the walk
    /// restarts from the page's oldest message and the history is open
    /// again.
    pub fn note_newest_page(&mut self, oldest: Timestamp, joined: bool) {
        match self.frontier {
            Some(frontier) if joined => self.frontier = Some(frontier.min(oldest)),
            _ => {
                self.frontier = Some(oldest);
                if !joined {
                    self.exhausted = false;
                }
            }
        }
    }

    /// Loads the next older page.
    ///
    /// Remote pages are backfilled into `cache` without overwriting
    /// anything already cached.
    ///
    /// # Errors
    ///
    /// Returns [`PaginationError::Cancelled`] once `closed` turns `true`
    /// during a remote fetch, and [`PaginationError::Remote`] if the fetch
    /// fails.
    pub async fn load_older<S: KeyValueStore, R: RemoteStore>(
        &mut self,
        conversation: &ConversationId,
        cache: &LocalCacheStore<S>,
        remote: &R,
        known: &KnownHistory,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<HistoryPage, PaginationError> {
        let cached = cache.load(conversation).await;
        let older: Vec<Message> = cached
            .into_iter()
            .filter(|m| known.before.is_none_or(|before| m.created_at < before))
            .filter(|m| !known.ids.contains(&m.id))
            .collect();
        if !older.is_empty() {
            let skip = older.len().saturating_sub(self.page_size);
            return Ok(HistoryPage {
                messages: older.into_iter().skip(skip).collect(),
                source: PageSource::Cache,
                exhausted: false,
            });
        }

        if self.exhausted {
            return Ok(HistoryPage {
                messages: Vec::new(),
                source: PageSource::Remote,
                exhausted: true,
            });
        }

        let mut offset = self.frontier.map_or(0, |f| known.confirmed_since(f));
        for _ in 0..MAX_OVERLAP_SKIPS {
            let page = tokio::select! {
                result = remote.fetch_messages(conversation, self.page_size, offset) => result?,
                _ = closed.wait_for(|closed| *closed) => return Err(PaginationError::Cancelled),
            };
            self.exhausted = page.len() < self.page_size;
            let fetched = page.len();
            if let Some(oldest) = page.iter().map(|m| m.created_at).min() {
                self.frontier = Some(self.frontier.map_or(oldest, |f| f.min(oldest)));
            }

            let fresh: Vec<Message> = page
                .into_iter()
                .filter(|m| !m.id.is_temporary() && !known.ids.contains(&m.id))
                .collect();
            if !fresh.is_empty() || self.exhausted {
                let added = cache.backfill(conversation, fresh.clone()).await;
                tracing::debug!(
                    conversation = %conversation,
                    offset,
                    fetched,
                    backfilled = added,
                    exhausted = self.exhausted,
                    "fetched older page"
                );
                return Ok(HistoryPage {
                    messages: fresh,
                    source: PageSource::Remote,
                    exhausted: self.exhausted,
                });
            }
            offset += fetched;
        }

        tracing::warn!(conversation = %conversation, offset, "older pages keep overlapping");
        Ok(HistoryPage {
            messages: Vec::new(),
            source: PageSource::Remote,
            exhausted: false,
        })
    }
}
