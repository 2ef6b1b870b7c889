use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{StoreError, TaggedStore};

/// Minimum time between two sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process [`TaggedStore`].
///
/// Expired entries are dropped on the read that notices them, and writes
/// sweep out whatever expired unread (along with tag-index members that no
/// longer point at a live entry) at most once per [`SWEEP_INTERVAL`]. Uses
/// the tokio clock so paused-time tests can move past a TTL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    tags: HashMap<String, HashSet<String>>,
    last_sweep: Option<Instant>,
}

impl Inner {
    fn sweep_if_due(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|last| now.duration_since(last) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);

        self.entries.retain(|_, slot| slot.expires_at > now);
        let entries = &self.entries;
        self.tags.retain(|_, keys| {
            keys.retain(|key| entries.contains_key(key));
            !keys.is_empty()
        });
    }
}

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of tags with a live index set.
    pub async fn tag_count(&self) -> usize {
        self.inner.read().await.tags.len()
    }
}

#[async_trait]
impl TaggedStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        tags: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.sweep_if_due(now);
        inner.entries.insert(
            key.to_owned(),
            Slot {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        for tag in tags {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_owned());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let inner = self.inner.read().await;
            match inner.entries.get(key) {
                None => return Ok(None),
                Some(slot) if slot.expires_at > Instant::now() => {
                    return Ok(Some(slot.value.clone()));
                }
                Some(_) => {}
            }
        }

        let mut inner = self.inner.write().await;
        if inner
            .entries
            .get(key)
            .is_some_and(|slot| slot.expires_at <= Instant::now())
        {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn invalidate(&self, tag: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(keys) = inner.tags.remove(tag) else {
            return Ok(0);
        };

        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = inner.entries.remove(&key) {
                if slot.expires_at > now {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
