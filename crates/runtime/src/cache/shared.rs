use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

use super::{CacheEntry, CacheError, CacheTier, EntryMeta, Tier, TierUsage};

/// Per-entry TTL taken from the entry's own metadata.
pub(crate) struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.meta.remaining())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.meta.remaining())
    }
}

/// L2: shared tier backed by a weighted moka cache.
pub struct SharedTier {
    cache: Cache<String, CacheEntry>,
    max_bytes: u64,
    evictions: Arc<AtomicU64>,
}

impl SharedTier {
    pub fn new(max_bytes: u64) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, entry: &CacheEntry| -> u32 {
                (entry.meta.size_bytes + key.len() as u64)
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .expire_after(EntryExpiry)
            .eviction_listener(move |key, _entry: CacheEntry, cause| {
                if cause.was_evicted() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(target: "cache", tier = "l2", key = %key, cause = ?cause, "Evicted entry");
                }
            })
            .build();
        Self {
            cache,
            max_bytes,
            evictions,
        }
    }
}

#[async_trait]
impl CacheTier for SharedTier {
    fn tier(&self) -> Tier {
        Tier::L2
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.cache.get(key).await {
            Some(entry) if entry.meta.is_expired() => {
                self.cache.invalidate(key).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.meta.size_bytes > self.max_bytes {
            return Err(CacheError::TooLarge {
                size: entry.meta.size_bytes,
                tier: Tier::L2,
            });
        }
        self.cache.insert(entry.meta.key.clone(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, CacheError> {
        Ok(self.cache.iter().map(|(_, entry)| entry.meta.clone()).collect())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.meta.is_expired())
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in &expired {
            self.cache.invalidate(key).await;
        }
        self.cache.run_pending_tasks().await;
        Ok(expired.len() as u64)
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            entries: self.cache.entry_count(),
            bytes: self.cache.weighted_size(),
            capacity_bytes: self.max_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
