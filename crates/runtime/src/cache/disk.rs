use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheError, CacheTier, EntryMeta, Tier, TierUsage};
use crate::sql_shape::hash_text;

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// Index record for one entry file.
#[derive(Debug, Clone)]
struct DiskSlot {
    path: PathBuf,
    file_bytes: u64,
    meta: EntryMeta,
}

struct DiskExpiry;

impl Expiry<String, DiskSlot> for DiskExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &DiskSlot,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.meta.remaining())
    }
}

/// L3: one file per entry under a directory, indexed in memory.
///
/// Files hold a JSON metadata line followed by the payload. Writes go to a
/// `.tmp` file that is renamed into place, and evicted entries have their
/// file deleted by the index eviction listener.
pub struct DiskTier {
    directory: PathBuf,
    max_bytes: u64,
    index: Cache<String, DiskSlot>,
    evictions: Arc<AtomicU64>,
}

impl DiskTier {
    pub async fn new(directory: impl Into<PathBuf>, max_size_mb: u64) -> Result<Self, CacheError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;

        let max_bytes = max_size_mb * 1024 * 1024;
        info!(
            target: "cache",
            directory = ?directory,
            max_size_mb,
            "Initializing persistent cache tier"
        );

        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();
        let index = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &String, slot: &DiskSlot| -> u32 {
                slot.file_bytes.try_into().unwrap_or(u32::MAX)
            })
            .expire_after(DiskExpiry)
            .eviction_listener(move |key, slot: DiskSlot, cause| {
                if cause.was_evicted() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    target: "cache",
                    tier = "l3",
                    key = %key,
                    size_bytes = slot.file_bytes,
                    cause = ?cause,
                    "Removing cache file"
                );
                if let Err(e) = std::fs::remove_file(&slot.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            target: "cache",
                            path = ?slot.path,
                            error = %e,
                            "Failed to delete evicted cache file"
                        );
                    }
                }
            })
            .build();

        let tier = Self {
            directory,
            max_bytes,
            index,
            evictions,
        };
        tier.hydrate_from_disk().await?;
        Ok(tier)
    }

    /// Rebuild the index from entry files left by a previous run.
    async fn hydrate_from_disk(&self) -> Result<(), CacheError> {
        let mut read_dir = tokio::fs::read_dir(&self.directory).await?;
        let mut hydrated = 0u64;
        let mut total_bytes = 0u64;

        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let file_bytes = match dir_entry.metadata().await {
                Ok(m) => m.len(),
                Err(_) => continue,
            };
            let meta = match read_meta(path.clone()).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(target: "cache", path = ?path, error = %e, "Discarding unreadable cache file");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };
            if meta.is_expired() {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            self.index
                .insert(
                    meta.key.clone(),
                    DiskSlot {
                        path,
                        file_bytes,
                        meta,
                    },
                )
                .await;
            hydrated += 1;
            total_bytes += file_bytes;
        }

        let cleaned = self.cleanup_temp_files().await?;
        info!(
            target: "cache",
            files = hydrated,
            total_kb = total_bytes / 1024,
            temp_files_removed = cleaned,
            "Hydrated persistent cache tier"
        );
        Ok(())
    }

    /// Remove `.tmp` files orphaned by interrupted writes.
    async fn cleanup_temp_files(&self) -> Result<u64, CacheError> {
        let mut read_dir = tokio::fs::read_dir(&self.directory).await?;
        let mut cleaned = 0;
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(TEMP_EXTENSION) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(target: "cache", path = ?path, error = %e, "Failed to clean up temp file");
                } else {
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    /// Delete files the index no longer references, including temp files.
    pub async fn defragment(&self) -> Result<u64, CacheError> {
        self.index.run_pending_tasks().await;
        let live: HashSet<PathBuf> = self.index.iter().map(|(_, slot)| slot.path).collect();

        let mut read_dir = tokio::fs::read_dir(&self.directory).await?;
        let mut removed = 0;
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            let orphan = match ext {
                Some(ENTRY_EXTENSION) => !live.contains(&path),
                Some(TEMP_EXTENSION) => true,
                _ => false,
            };
            if orphan && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let digest = hash_text(key);
        self.directory.join(format!(
            "{}_{}.{}",
            &digest[..32],
            uuid::Uuid::new_v4().simple(),
            ENTRY_EXTENSION
        ))
    }
}

async fn read_meta(path: PathBuf) -> Result<EntryMeta, CacheError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(serde_json::from_str(line.trim_end())?)
    })
    .await
    .map_err(|e| CacheError::Task(e.to_string()))?
}

fn read_entry_file(path: &Path) -> Result<CacheEntry, CacheError> {
    let bytes = std::fs::read(path)?;
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CacheError::Corrupt(path.display().to_string()))?;
    let meta: EntryMeta = serde_json::from_slice(&bytes[..split])?;
    let payload = bytes[split + 1..].to_vec();
    if payload.len() as u64 != meta.size_bytes {
        return Err(CacheError::Corrupt(path.display().to_string()));
    }
    Ok(CacheEntry {
        meta,
        payload: Arc::new(payload),
    })
}

fn write_entry_file(path: &Path, entry: &CacheEntry) -> Result<u64, CacheError> {
    let tmp_path = path.with_extension(TEMP_EXTENSION);
    let mut file = std::fs::File::create(&tmp_path)?;
    serde_json::to_writer(&mut file, &entry.meta)?;
    file.write_all(b"\n")?;
    file.write_all(&entry.payload)?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(size)
}

#[async_trait]
impl CacheTier for DiskTier {
    fn tier(&self) -> Tier {
        Tier::L3
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(slot) = self.index.get(key).await else {
            return Ok(None);
        };
        if slot.meta.is_expired() {
            self.index.invalidate(key).await;
            return Ok(None);
        }

        let path = slot.path.clone();
        let read = tokio::task::spawn_blocking(move || read_entry_file(&path))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;
        match read {
            Ok(mut entry) => {
                entry.meta.generation = slot.meta.generation;
                Ok(Some(entry))
            }
            Err(e) => {
                // Drop the corrupted entry; the listener removes the file.
                self.index.invalidate(key).await;
                Err(e)
            }
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        if entry.meta.size_bytes > self.max_bytes {
            return Err(CacheError::TooLarge {
                size: entry.meta.size_bytes,
                tier: Tier::L3,
            });
        }
        let path = self.file_for(&entry.meta.key);
        let meta = entry.meta.clone();
        let write_path = path.clone();
        let file_bytes = tokio::task::spawn_blocking(move || write_entry_file(&write_path, &entry))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))??;

        debug!(target: "cache", tier = "l3", key = %meta.key, file_bytes, "Wrote cache file");
        self.index
            .insert(
                meta.key.clone(),
                DiskSlot {
                    path,
                    file_bytes,
                    meta,
                },
            )
            .await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.index.remove(key).await.is_some())
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, CacheError> {
        Ok(self.index.iter().map(|(_, slot)| slot.meta).collect())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|(_, slot)| slot.meta.is_expired())
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in &expired {
            self.index.invalidate(key).await;
        }
        self.index.run_pending_tasks().await;
        Ok(expired.len() as u64)
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            entries: self.index.entry_count(),
            bytes: self.index.weighted_size(),
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
    async fn test_write_read_and_hydrate() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier = DiskTier::new(dir.path(), 16).await.unwrap();
            tier.put(test_entry("report:1", 2048, 600)).await.unwrap();
            let entry = tier.get("report:1").await.unwrap().unwrap();
            assert_eq!(entry.payload.len(), 2048);
        }

        std::fs::write(dir.path().join("stray.tmp"), b"partial").unwrap();
        let tier = DiskTier::new(dir.path(), 16).await.unwrap();
        assert!(!dir.path().join("stray.tmp").exists());
        let entry = tier.get("report:1").await.unwrap().unwrap();
        assert_eq!(entry.meta.key, "report:1");
    }

    #[tokio::test]
    async fn test_generation_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry("k", 32, 600);
        entry.meta.generation = 41;
        DiskTier::new(dir.path(), 16).await.unwrap().put(entry).await.unwrap();

        let reopened = DiskTier::new(dir.path(), 16).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap().unwrap().meta.generation, 0);
        assert_eq!(reopened.entries().await.unwrap()[0].generation, 0);
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path(), 16).await.unwrap();
        tier.put(test_entry("k", 64, 600)).await.unwrap();
        assert!(tier.remove("k").await.unwrap());
        tier.index.run_pending_tasks().await;

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 0);
        assert_eq!(tier.defragment().await.unwrap(), 0);
    }
}
