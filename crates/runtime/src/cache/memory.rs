use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheEntry, CacheError, CacheTier, EntryMeta, Tier, TierUsage};

struct Slot {
    entry: CacheEntry,
    last_access: AtomicU64,
}

/// L1: in-process map with a byte cap and least-recently-used eviction.
pub struct MemoryTier {
    entries: DashMap<String, Slot>,
    bytes: AtomicU64,
    max_bytes: u64,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            bytes: AtomicU64::new(0),
            max_bytes,
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_slot(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                self.bytes.fetch_sub(slot.entry.meta.size_bytes, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Fraction of the byte cap in use.
    pub fn pressure(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.bytes.load(Ordering::Acquire) as f64 / self.max_bytes as f64
    }

    /// Evict least recently used entries until usage is at most `target_bytes`.
    pub fn evict_to(&self, target_bytes: u64) -> u64 {
        let mut evicted = 0;
        while self.bytes.load(Ordering::Acquire) > target_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|slot| slot.last_access.load(Ordering::Relaxed))
                .map(|slot| slot.key().clone());
            let Some(key) = oldest else { break };
            if self.remove_slot(&key) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(target: "cache", tier = "l1", evicted, "Evicted entries under byte pressure");
        }
        evicted
    }

    pub fn shrink(&self) {
        self.entries.shrink_to_fit();
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn tier(&self) -> Tier {
        Tier::L1
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let found = self.entries.get(key).map(|slot| {
            slot.last_access.store(self.tick(), Ordering::Relaxed);
            slot.entry.clone()
        });
        match found {
            Some(entry) if entry.meta.is_expired() => {
                self.remove_slot(key);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let size = entry.meta.size_bytes;
        if size > self.max_bytes {
            return Err(CacheError::TooLarge { size, tier: Tier::L1 });
        }
        let slot = Slot {
            entry,
            last_access: AtomicU64::new(self.tick()),
        };
        let key = slot.entry.meta.key.clone();
        if let Some(old) = self.entries.insert(key, slot) {
            self.bytes.fetch_sub(old.entry.meta.size_bytes, Ordering::AcqRel);
        }
        self.bytes.fetch_add(size, Ordering::AcqRel);
        self.evict_to(self.max_bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.remove_slot(key))
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, CacheError> {
        Ok(self
            .entries
            .iter()
            .map(|slot| slot.entry.meta.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|slot| slot.entry.meta.is_expired())
            .map(|slot| slot.key().clone())
            .collect();
        Ok(expired.iter().filter(|key| self.remove_slot(key)).count() as u64)
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            entries: self.entries.len() as u64,
            bytes: self.bytes.load(Ordering::Acquire),
            capacity_bytes: self.max_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_entry;

    #[tokio::test]
    async fn test_lru_eviction_under_byte_cap() {
        let tier = MemoryTier::new(300);
        tier.put(test_entry("a", 100, 60)).await.unwrap();
        tier.put(test_entry("b", 100, 60)).await.unwrap();
        tier.put(test_entry("c", 100, 60)).await.unwrap();

        // Touch "a" so "b" is the least recently used.
        assert!(tier.get("a").await.unwrap().is_some());
        tier.put(test_entry("d", 100, 60)).await.unwrap();

        assert!(tier.get("b").await.unwrap().is_none());
        assert!(tier.get("a").await.unwrap().is_some());
        let usage = tier.usage();
        assert_eq!(usage.bytes, 300);
        assert_eq!(usage.evictions, 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_byte_count() {
        let tier = MemoryTier::new(1_000);
        tier.put(test_entry("a", 100, 60)).await.unwrap();
        tier.put(test_entry("a", 250, 60)).await.unwrap();
        assert_eq!(tier.usage().bytes, 250);
        assert!(tier.remove("a").await.unwrap());
        assert_eq!(tier.usage().bytes, 0);
    }
}
