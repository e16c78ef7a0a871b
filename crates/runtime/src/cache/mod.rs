//! Three-tier result cache.
//!
//! `get` reads L1, L2 then L3. Hits on a lower tier are copied upward in the
//! background once a key has been read `promotion_threshold` times. `put`
//! places an entry on one tier chosen by size and TTL.
//!
//! Every read, write and invalidation goes through an [`InvalidationBarrier`]
//! so that an invalidation is never undone by a concurrent write of an older
//! value.

mod barrier;
mod compression;
mod disk;
mod memory;
mod shared;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use sluice_common::config::CacheSettings;
use sluice_error::{ErrorCode, SluiceError};

use barrier::{InvalidationBarrier, ScopeMatcher};
pub use disk::DiskTier;
pub use memory::MemoryTier;
pub use shared::SharedTier;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("entry of {size} bytes does not fit {tier:?}")]
    TooLarge { size: u64, tier: Tier },
    #[error("corrupt cache file {0}")]
    Corrupt(String),
    #[error("cache task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::L1, Tier::L2, Tier::L3];

    fn index(self) -> usize {
        match self {
            Tier::L1 => 0,
            Tier::L2 => 1,
            Tier::L3 => 2,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Metadata stored alongside a payload on every tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    /// Stored payload size, after compression.
    pub size_bytes: u64,
    pub original_bytes: u64,
    pub compressed: bool,
    pub ttl_secs: u64,
    pub created_at_ms: i64,
    pub tags: Vec<String>,
    /// Barrier generation at write time. Generations are per process, so
    /// this is never persisted and reads back as 0.
    #[serde(skip)]
    pub generation: u64,
}

impl EntryMeta {
    pub fn expires_at_ms(&self) -> i64 {
        self.created_at_ms + (self.ttl_secs as i64).saturating_mul(1000)
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at_ms()
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_millis((self.expires_at_ms() - now_ms()).max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub payload: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub entries: u64,
    pub bytes: u64,
    pub capacity_bytes: u64,
    pub evictions: u64,
}

#[async_trait]
pub trait CacheTier: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    async fn entries(&self) -> Result<Vec<EntryMeta>, CacheError>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, CacheError>;

    fn usage(&self) -> TierUsage;
}

/// What an invalidation covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum InvalidationScope {
    Exact(String),
    /// Glob over keys: `*` any run, `?` one character.
    Pattern(String),
    Table(String),
    Project(String),
    User(String),
    Tag(String),
    Global,
}

/// Token taken before computing a value; a later `put` with it is dropped if
/// an overlapping invalidation started in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket(u64);

/// Caller-facing view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub tier: Tier,
    pub size_bytes: u64,
    pub ttl_secs: u64,
    pub compressed: bool,
    pub access_count: u64,
    pub last_accessed_ms: Option<i64>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_access_micros: f64,
    /// L1 bytes over the L1 cap.
    pub memory_pressure: f64,
    pub promotions: u64,
    pub invalidations: u64,
    pub dropped_writes: u64,
    pub top_keys: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayoutReport {
    pub evicted: u64,
    pub promoted: u64,
    pub compressed: u64,
    pub purged: u64,
    pub defragmented: u64,
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Access {
    count: u64,
    last_accessed_ms: i64,
}

struct Shared {
    settings: CacheSettings,
    l1: MemoryTier,
    l2: SharedTier,
    l3: Option<DiskTier>,
    barrier: InvalidationBarrier,
    access: DashMap<String, Access>,
    counters: [TierCounters; 3],
    lookups: AtomicU64,
    access_micros: AtomicU64,
    promotions: AtomicU64,
    invalidations: AtomicU64,
    dropped_writes: AtomicU64,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct CacheManager {
    shared: Arc<Shared>,
}

impl CacheManager {
    /// Build the tiers. A persistent tier that cannot be opened is skipped.
    pub async fn new(settings: &CacheSettings) -> Self {
        let l3 = if settings.enabled {
            match DiskTier::new(&settings.l3_directory, settings.l3_max_size_mb).await {
                Ok(tier) => Some(tier),
                Err(e) => {
                    warn!(
                        target: "cache",
                        directory = %settings.l3_directory,
                        error = %e,
                        "Persistent cache tier unavailable, continuing without it"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            shared: Arc::new(Shared {
                settings: settings.clone(),
                l1: MemoryTier::new(settings.l1_max_bytes),
                l2: SharedTier::new(settings.l2_max_bytes),
                l3,
                barrier: InvalidationBarrier::new(),
                access: DashMap::new(),
                counters: Default::default(),
                lookups: AtomicU64::new(0),
                access_micros: AtomicU64::new(0),
                promotions: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
                dropped_writes: AtomicU64::new(0),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.settings.enabled
    }

    /// Take before computing a value that will be passed to [`put`](Self::put).
    pub fn ticket(&self) -> CacheTicket {
        CacheTicket(self.shared.barrier.current())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let started = Instant::now();
        let ticket = self.shared.barrier.current();
        let found = self.shared.lookup(key).await;
        self.shared.lookups.fetch_add(1, Ordering::Relaxed);
        self.shared
            .access_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        let (entry, tier) = found?;
        let count = self.shared.record_access(key);
        if tier != Tier::L1 && count >= self.shared.settings.promotion_threshold {
            self.spawn_promotion(entry.clone(), tier, ticket);
        }

        match decode(&entry) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "cache", key, error = %e, "Cached value could not be decoded");
                None
            }
        }
    }

    /// Store `value`. Returns whether it was written.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: Vec<String>,
        ticket: CacheTicket,
    ) -> bool {
        if !self.is_enabled() || ttl.is_zero() {
            return false;
        }
        let entry = match self.shared.encode(key, value, ttl, tags) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(target: "cache", key, error = %e, "Value could not be encoded for caching");
                return false;
            }
        };
        let Some(tier) = self.shared.select_tier(entry.meta.size_bytes, ttl) else {
            debug!(target: "cache", key, size = entry.meta.size_bytes, "Entry too large for any tier");
            return false;
        };

        let written = self.shared.store(entry, tier, ticket.0, true).await;
        if written {
            self.shared.access.remove(key);
        }
        written
    }

    /// Remove every entry the scope covers from all tiers.
    pub async fn invalidate(&self, scope: InvalidationScope) -> sluice_error::Result<u64> {
        let matcher = ScopeMatcher::compile(&scope).map_err(|e| {
            SluiceError::new(ErrorCode::InvalidConfig, format!("Invalid invalidation pattern: {}", e))
        })?;
        Ok(self.shared.invalidate(matcher).await)
    }

    pub async fn inspect(&self, key: &str) -> Option<CacheEntryInfo> {
        for tier in self.shared.tiers() {
            let Ok(entries) = tier.entries().await else { continue };
            if let Some(meta) = entries.into_iter().find(|m| m.key == key && !m.is_expired()) {
                let access = self.shared.access.get(key).map(|a| *a);
                return Some(CacheEntryInfo {
                    key: meta.key,
                    tier: tier.tier(),
                    size_bytes: meta.size_bytes,
                    ttl_secs: meta.ttl_secs,
                    compressed: meta.compressed,
                    access_count: access.map_or(0, |a| a.count),
                    last_accessed_ms: access.map(|a| a.last_accessed_ms),
                    tags: meta.tags,
                });
            }
        }
        None
    }

    /// Evict, promote, compress, purge and defragment in one pass.
    pub async fn optimize_layout(&self) -> LayoutReport {
        self.shared.optimize_layout().await
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats()
    }

    /// Wait for background promotions started so far.
    pub async fn flush(&self) {
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.tasks.reopen();
    }

    /// Copy `entry` upward. `ticket` is the barrier generation seen before the
    /// read, so an invalidation that starts after it drops the copy.
    fn spawn_promotion(&self, entry: CacheEntry, from: Tier, ticket: u64) {
        let Some(target) = self.shared.promotion_target(entry.meta.size_bytes, from) else {
            return;
        };
        let shared = self.shared.clone();
        self.shared.tasks.spawn(async move {
            let key = entry.meta.key.clone();
            if shared.store(entry, target, ticket, false).await {
                shared.promotions.fetch_add(1, Ordering::Relaxed);
                debug!(target: "cache", key = %key, from = ?from, to = ?target, "Promoted entry");
            }
        });
    }
}

fn decode<T: DeserializeOwned>(entry: &CacheEntry) -> Result<T, CacheError> {
    if entry.meta.compressed {
        let raw = compression::decompress(&entry.payload)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(&entry.payload)?)
    }
}

impl Shared {
    fn tiers(&self) -> Vec<&dyn CacheTier> {
        let mut tiers: Vec<&dyn CacheTier> = vec![&self.l1, &self.l2];
        if let Some(l3) = &self.l3 {
            tiers.push(l3);
        }
        tiers
    }

    fn tier(&self, tier: Tier) -> Option<&dyn CacheTier> {
        match tier {
            Tier::L1 => Some(&self.l1),
            Tier::L2 => Some(&self.l2),
            Tier::L3 => self.l3.as_ref().map(|t| t as &dyn CacheTier),
        }
    }

    async fn lookup(&self, key: &str) -> Option<(CacheEntry, Tier)> {
        let _guard = self.barrier.read(key).await;
        for tier in self.tiers() {
            let counters = &self.counters[tier.tier().index()];
            match tier.get(key).await {
                Ok(Some(entry)) => {
                    if self
                        .barrier
                        .is_hidden(entry.meta.generation, key, &entry.meta.tags)
                    {
                        counters.misses.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(target: "cache", key, tier = ?tier.tier(), "Cache hit");
                    return Some((entry, tier.tier()));
                }
                Ok(None) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "cache", key, tier = ?tier.tier(), error = %e, "Cache tier read failed, skipping");
                }
            }
        }
        None
    }

    fn record_access(&self, key: &str) -> u64 {
        let mut access = self.access.entry(key.to_string()).or_insert(Access {
            count: 0,
            last_accessed_ms: 0,
        });
        access.count += 1;
        access.last_accessed_ms = now_ms();
        access.count
    }

    fn encode<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: Vec<String>,
    ) -> Result<CacheEntry, CacheError> {
        let raw = serde_json::to_vec(value)?;
        let original_bytes = raw.len() as u64;
        let (payload, compressed) = if original_bytes >= self.settings.compression_threshold_bytes {
            match compression::compress_if_worthwhile(&raw, self.settings.min_compression_ratio)? {
                Some(smaller) => (smaller, true),
                None => (raw, false),
            }
        } else {
            (raw, false)
        };
        Ok(CacheEntry {
            meta: EntryMeta {
                key: key.to_string(),
                size_bytes: payload.len() as u64,
                original_bytes,
                compressed,
                ttl_secs: ttl.as_secs().max(1),
                created_at_ms: now_ms(),
                tags,
                generation: 0,
            },
            payload: Arc::new(payload),
        })
    }

    /// Small and long-lived entries go to L1, medium ones to L2, large or
    /// short-lived ones to L3.
    fn select_tier(&self, size: u64, ttl: Duration) -> Option<Tier> {
        let s = &self.settings;
        let ttl_secs = ttl.as_secs();
        let preferred = if ttl_secs < s.short_ttl_secs || size > s.l2_max_entry_bytes {
            Tier::L3
        } else if size <= s.l1_max_entry_bytes && ttl_secs >= s.l1_min_ttl_secs {
            Tier::L1
        } else {
            Tier::L2
        };
        match preferred {
            Tier::L3 if self.l3.is_none() => (size <= s.l2_max_entry_bytes).then_some(Tier::L2),
            tier => Some(tier),
        }
    }

    fn promotion_target(&self, size: u64, from: Tier) -> Option<Tier> {
        if size <= self.settings.l1_max_entry_bytes {
            Some(Tier::L1)
        } else if from == Tier::L3 && size <= self.settings.l2_max_entry_bytes {
            Some(Tier::L2)
        } else {
            None
        }
    }

    /// Write `entry` to `tier` under the key's stripe, unless an invalidation
    /// that started after `ticket` covers it. `exclusive` removes the key from
    /// the other tiers so an older copy cannot shadow the new one.
    async fn store(&self, mut entry: CacheEntry, tier: Tier, ticket: u64, exclusive: bool) -> bool {
        let Some(target) = self.tier(tier) else {
            return false;
        };
        let key = entry.meta.key.clone();
        let _guard = self.barrier.write(&key).await;
        if self.barrier.is_stale(ticket, &key, &entry.meta.tags) {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            debug!(target: "cache", key = %key, "Dropping write that overlaps an invalidation");
            return false;
        }
        if exclusive {
            entry.meta.generation = self.barrier.current();
            for other in self.tiers().into_iter().filter(|t| t.tier() != tier) {
                if let Err(e) = other.remove(&key).await {
                    warn!(target: "cache", key = %key, tier = ?other.tier(), error = %e, "Failed to remove older copy");
                }
            }
        }
        match target.put(entry).await {
            Ok(()) => {
                debug!(target: "cache", key = %key, tier = ?tier, "Stored entry");
                true
            }
            Err(e) => {
                warn!(target: "cache", key = %key, tier = ?tier, error = %e, "Cache tier write failed, skipping");
                false
            }
        }
    }

    async fn invalidate(&self, matcher: ScopeMatcher) -> u64 {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let generation = self.barrier.begin(matcher.clone());

        let mut removed = 0;
        if let ScopeMatcher::Exact(key) = &matcher {
            let _guard = self.barrier.write(key).await;
            removed += self.remove_everywhere(key).await;
        } else {
            let _guards = self.barrier.write_all().await;
            for tier in self.tiers() {
                let metas = match tier.entries().await {
                    Ok(metas) => metas,
                    Err(e) => {
                        warn!(target: "cache", tier = ?tier.tier(), error = %e, "Cannot list tier for invalidation");
                        continue;
                    }
                };
                for meta in metas.iter().filter(|m| matcher.matches(&m.key, &m.tags)) {
                    match tier.remove(&meta.key).await {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(e) => warn!(target: "cache", key = %meta.key, error = %e, "Invalidation failed on tier"),
                    }
                    self.access.remove(&meta.key);
                }
            }
        }

        self.barrier.finish(generation);
        debug!(target: "cache", generation, removed, exact = matcher.is_exact(), "Invalidation complete");
        removed
    }

    async fn remove_everywhere(&self, key: &str) -> u64 {
        let mut removed = 0;
        for tier in self.tiers() {
            match tier.remove(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(target: "cache", key, tier = ?tier.tier(), error = %e, "Invalidation failed on tier"),
            }
        }
        self.access.remove(key);
        removed
    }

    async fn optimize_layout(&self) -> LayoutReport {
        let mut report = LayoutReport::default();

        for tier in self.tiers() {
            match tier.purge_expired().await {
                Ok(n) => report.purged += n,
                Err(e) => warn!(target: "cache", tier = ?tier.tier(), error = %e, "Purge failed"),
            }
        }
        let purged_keys: Vec<String> = self
            .access
            .iter()
            .filter(|a| now_ms() - a.last_accessed_ms > (self.settings.analytical_ttl_secs as i64) * 1000)
            .map(|a| a.key().clone())
            .collect();
        for key in purged_keys {
            self.access.remove(&key);
        }

        if self.l1.pressure() > 0.9 {
            report.evicted = self.l1.evict_to(self.settings.l1_max_bytes / 4 * 3);
        }

        if let Ok(l2_entries) = self.l2.entries().await {
            for meta in l2_entries {
                let hot = self
                    .access
                    .get(&meta.key)
                    .is_some_and(|a| a.count >= self.settings.promotion_threshold);
                if !hot || meta.size_bytes > self.settings.l1_max_entry_bytes {
                    continue;
                }
                let ticket = self.barrier.current();
                if let Ok(Some(entry)) = self.l2.get(&meta.key).await {
                    if self.store(entry, Tier::L1, ticket, false).await {
                        report.promoted += 1;
                    }
                }
            }
        }

        for tier in [Tier::L1, Tier::L2] {
            report.compressed += self.compress_tier(tier).await;
        }

        if let Some(l3) = &self.l3 {
            match l3.defragment().await {
                Ok(n) => report.defragmented += n,
                Err(e) => warn!(target: "cache", error = %e, "Defragmentation failed"),
            }
        }
        self.l1.shrink();

        self.promotions.fetch_add(report.promoted, Ordering::Relaxed);
        debug!(target: "cache", ?report, "Cache layout optimized");
        report
    }

    async fn compress_tier(&self, tier: Tier) -> u64 {
        let Some(target) = self.tier(tier) else { return 0 };
        let Ok(metas) = target.entries().await else { return 0 };
        let mut compressed = 0;
        for meta in metas {
            if meta.compressed || meta.size_bytes < self.settings.compression_threshold_bytes {
                continue;
            }
            let ticket = self.barrier.current();
            let Ok(Some(entry)) = target.get(&meta.key).await else { continue };
            match compression::compress_if_worthwhile(&entry.payload, self.settings.min_compression_ratio) {
                Ok(Some(smaller)) => {
                    let mut meta = entry.meta.clone();
                    meta.size_bytes = smaller.len() as u64;
                    meta.compressed = true;
                    let rewritten = CacheEntry {
                        meta,
                        payload: Arc::new(smaller),
                    };
                    if self.store(rewritten, tier, ticket, false).await {
                        compressed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(target: "cache", key = %meta.key, error = %e, "Compression failed"),
            }
        }
        compressed
    }

    fn stats(&self) -> CacheStats {
        let tiers: Vec<TierStats> = Tier::ALL
            .iter()
            .map(|tier| {
                let usage = self.tier(*tier).map(|t| t.usage()).unwrap_or_default();
                let counters = &self.counters[tier.index()];
                TierStats {
                    tier: *tier,
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    evictions: usage.evictions,
                    entries: usage.entries,
                    bytes: usage.bytes,
                }
            })
            .collect();

        let hits: u64 = tiers.iter().map(|t| t.hits).sum();
        let lookups = self.lookups.load(Ordering::Relaxed);
        let misses = lookups.saturating_sub(hits);

        let mut top_keys: Vec<(String, u64)> = self
            .access
            .iter()
            .map(|a| (a.key().clone(), a.count))
            .collect();
        top_keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_keys.truncate(self.settings.top_keys);

        CacheStats {
            tiers,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            avg_access_micros: if lookups == 0 {
                0.0
            } else {
                self.access_micros.load(Ordering::Relaxed) as f64 / lookups as f64
            },
            memory_pressure: self.l1.pressure(),
            promotions: self.promotions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            top_keys,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_entry(key: &str, size: usize, ttl_secs: u64) -> CacheEntry {
    CacheEntry {
        meta: EntryMeta {
            key: key.to_string(),
            size_bytes: size as u64,
            original_bytes: size as u64,
            compressed: false,
            ttl_secs,
            created_at_ms: now_ms(),
            tags: Vec::new(),
            generation: 0,
        },
        payload: Arc::new(vec![b'x'; size]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(dir: &std::path::Path) -> CacheManager {
        CacheManager::new(&CacheSettings {
            l3_directory: dir.display().to_string(),
            l1_max_entry_bytes: 1024,
            promotion_threshold: 2,
            ..CacheSettings::default()
        })
        .await
    }

    #[tokio::test]
    async fn test_tier_selection() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let t = cache.ticket();

        assert!(cache.put("small", &"v", Duration::from_secs(300), vec![], t).await);
        assert!(cache.put("short", &"v", Duration::from_secs(5), vec![], t).await);
        let medium = "m".repeat(2_000);
        assert!(cache.put("medium", &medium, Duration::from_secs(300), vec![], t).await);

        assert_eq!(cache.inspect("small").await.unwrap().tier, Tier::L1);
        assert_eq!(cache.inspect("short").await.unwrap().tier, Tier::L3);
        let info = cache.inspect("medium").await.unwrap();
        assert_eq!(info.tier, Tier::L2);
        assert!(!info.compressed);
    }

    #[tokio::test]
    async fn test_large_values_are_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let rows: Vec<String> = (0..1000).map(|i| format!("row-{}", i % 5)).collect();
        assert!(cache.put("big", &rows, Duration::from_secs(300), vec![], cache.ticket()).await);

        let info = cache.inspect("big").await.unwrap();
        assert!(info.compressed);
        let back: Vec<String> = cache.get("big").await.unwrap();
        assert_eq!(back, rows);
    }

    #[tokio::test]
    async fn test_promotion_after_repeated_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        assert!(cache.put("k", &42u32, Duration::from_secs(5), vec![], cache.ticket()).await);
        assert_eq!(cache.inspect("k").await.unwrap().tier, Tier::L3);

        for _ in 0..2 {
            assert_eq!(cache.get::<u32>("k").await, Some(42));
        }
        cache.flush().await;
        assert_eq!(cache.inspect("k").await.unwrap().tier, Tier::L1);
        assert_eq!(cache.stats().promotions, 1);
    }

    #[tokio::test]
    async fn test_invalidation_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let t = cache.ticket();
        let ttl = Duration::from_secs(300);
        cache.put("q:1", &1, ttl, vec!["table:orders".into(), "user:alice".into()], t).await;
        cache.put("q:2", &2, ttl, vec!["table:users".into(), "user:bob".into()], t).await;
        cache.put("r:3", &3, ttl, vec!["project:p1".into()], t).await;

        assert_eq!(cache.invalidate(InvalidationScope::Table("orders".into())).await.unwrap(), 1);
        assert_eq!(cache.get::<i32>("q:1").await, None);
        assert_eq!(cache.invalidate(InvalidationScope::Pattern("q:*".into())).await.unwrap(), 1);
        assert_eq!(cache.get::<i32>("q:2").await, None);
        assert_eq!(cache.get::<i32>("r:3").await, Some(3));
        assert_eq!(cache.invalidate(InvalidationScope::Global).await.unwrap(), 1);
        assert_eq!(cache.get::<i32>("r:3").await, None);
    }

    #[tokio::test]
    async fn test_put_with_stale_ticket_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let before = cache.ticket();
        cache
            .invalidate(InvalidationScope::Table("orders".into()))
            .await
            .unwrap();

        let ttl = Duration::from_secs(300);
        assert!(!cache.put("q", &1, ttl, vec!["table:orders".into()], before).await);
        // Unrelated tables are unaffected.
        assert!(cache.put("q2", &1, ttl, vec!["table:users".into()], before).await);
        assert!(cache.put("q", &1, ttl, vec!["table:orders".into()], cache.ticket()).await);
        assert_eq!(cache.stats().dropped_writes, 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_promotion_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let tags = vec!["table:orders".to_string()];
        assert!(cache.put("k", &7u32, Duration::from_secs(5), tags, cache.ticket()).await);

        // The second read schedules a promotion; invalidate before it is awaited.
        assert_eq!(cache.get::<u32>("k").await, Some(7));
        assert_eq!(cache.get::<u32>("k").await, Some(7));
        cache
            .invalidate(InvalidationScope::Table("orders".into()))
            .await
            .unwrap();
        cache.flush().await;

        assert_eq!(cache.get::<u32>("k").await, None);
        assert!(cache.inspect("k").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_after_restart_covers_reloaded_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let before = manager(dir.path()).await;
            for _ in 0..5 {
                before.invalidate(InvalidationScope::Global).await.unwrap();
            }
            assert!(before.put("k", &"old", Duration::from_secs(5), vec![], before.ticket()).await);
            assert_eq!(before.inspect("k").await.unwrap().tier, Tier::L3);
        }

        let cache = manager(dir.path()).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("old"));
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("old"));
        assert!(cache.invalidate(InvalidationScope::Global).await.unwrap() >= 1);
        cache.flush().await;

        assert_eq!(cache.get::<String>("k").await, None);
        assert!(cache.inspect("k").await.is_none());
    }

    #[tokio::test]
    async fn test_stats_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path()).await;
        let ttl = Duration::from_secs(300);
        cache.put("a", &"x", ttl, vec![], cache.ticket()).await;
        assert!(cache.get::<String>("a").await.is_some());
        assert!(cache.get::<String>("missing").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.top_keys, vec![("a".to_string(), 1)]);

        let report = cache.optimize_layout().await;
        assert_eq!(report.evicted, 0);
        assert_eq!(report.purged, 0);
    }
}
