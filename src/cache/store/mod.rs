//! Tagged key-value stores.
//!
//! A [`TaggedStore`] keeps opaque values under keys, indexes each key under
//! one or more tags, and can drop every key indexed under a tag in one
//! atomic step. Two backends are provided:
//!
//! - [`RedisStore`] — shared by every gateway instance.
//! - [`MemoryStore`] — single-process, for tests and local runs.
//!
//! Tag indexes are pruned lazily: when an entry expires its key stays in the
//! index sets it was added to until one of those tags is invalidated. Keys
//! rewritten under a different tag set also stay indexed under their old
//! tags, so invalidating an old tag still drops the new entry.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors a store backend can report.
///
/// None of these ever reach a client: the controller treats every one of
/// them as "caching unavailable for this request".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation `{operation}` timed out")]
    Timeout { operation: &'static str },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to invalidate tags {failed:?} ({removed} entries removed)")]
    PartialInvalidation { failed: Vec<String>, removed: usize },
}

/// The store contract the cache controller depends on.
#[async_trait]
pub trait TaggedStore: Send + Sync {
    /// Stores `value` under `key`, indexes `key` under every tag, and expires
    /// it `ttl` from now. Overwrites any existing value.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Returns the value under `key`, or `None` if it is absent, expired or
    /// invalidated.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Drops every entry indexed under `tag` and returns how many existed.
    ///
    /// A tag with no entries is a successful no-op.
    async fn invalidate(&self, tag: &str) -> Result<usize, StoreError>;

    /// Invalidates each tag in turn.
    ///
    /// Every tag is attempted even after a failure; failing tags are
    /// reported together in [`StoreError::PartialInvalidation`].
    async fn invalidate_many(&self, tags: &[String]) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut failed = Vec::new();

        for tag in tags {
            match self.invalidate(tag).await {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "tag invalidation failed");
                    failed.push(tag.clone());
                }
            }
        }

        if failed.is_empty() {
            Ok(removed)
        } else {
            Err(StoreError::PartialInvalidation { failed, removed })
        }
    }
}
