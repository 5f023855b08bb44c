//! Two-tier response cache.
//!
//! Artifacts live in a bounded in-memory map or in an on-disk keyed store,
//! never authoritatively in both (a handler may serve a small disk entry out
//! of memory when sizes agree, but installs pick exactly one tier). Disk
//! commits are write-to-temporary-then-rename so the serving path never
//! observes a partial file, and the metadata record becomes visible only
//! after the data file is durable.

pub mod key;
pub mod tee;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CacheConfig, CacheType};
pub use key::{ArtifactKind, CacheKey};

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

/// Memory-tier artifact. The payload is immutable once stored.
struct MemoryEntry {
    data: Bytes,
    headers: Vec<(String, String)>,
    etag: Option<String>,
    /// Unix millis after which the entry is dead.
    expires_at_ms: u64,
    /// Unix millis of the last `lookup` hit, for LRU ordering.
    last_used_ms: AtomicU64,
}

/// Metadata record committed next to each disk-tier data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetadata {
    pub headers: Vec<(String, String)>,
    pub etag: Option<String>,
    /// Exact byte length of the data file; verified on lookup.
    pub length: u64,
    /// Unix seconds after which the record is dead.
    pub expires_at: i64,
}

/// Result of a cache probe.
pub enum Lookup {
    MemoryHit {
        data: Bytes,
        headers: Vec<(String, String)>,
        etag: Option<String>,
    },
    DiskHit {
        path: PathBuf,
        meta: DiskMetadata,
    },
    Miss,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct Cache {
    enabled: bool,
    memory_enabled: bool,
    disk_enabled: bool,

    memory: DashMap<String, MemoryEntry>,
    memory_bytes: AtomicU64,
    max_memory_bytes: u64,
    max_memory_entries: usize,

    disk_root: PathBuf,
    max_disk_bytes: u64,

    cleanup_interval: Duration,
}

impl Cache {
    /// Build the cache and make sure the disk root exists.
    pub async fn new(config: &CacheConfig) -> Result<Arc<Cache>> {
        let memory_enabled =
            config.enabled && matches!(config.r#type, CacheType::Memory | CacheType::Hybrid);
        let disk_enabled =
            config.enabled && matches!(config.r#type, CacheType::Disk | CacheType::Hybrid);

        let disk_root = PathBuf::from(&config.disk_path);
        if disk_enabled {
            tokio::fs::create_dir_all(&disk_root)
                .await
                .with_context(|| format!("failed to create cache dir: {}", disk_root.display()))?;
        }

        let max_memory_entries = if config.max_memory_entries > 0 {
            config.max_memory_entries
        } else {
            // Derive a bound from the byte ceiling assuming ~1 KiB entries.
            (config.max_memory_size / 1024).max(1) as usize
        };

        Ok(Arc::new(Cache {
            enabled: config.enabled,
            memory_enabled,
            disk_enabled,
            memory: DashMap::new(),
            memory_bytes: AtomicU64::new(0),
            max_memory_bytes: config.max_memory_size,
            max_memory_entries,
            disk_root,
            max_disk_bytes: config.max_disk_size,
            cleanup_interval: config.cleanup_interval,
        }))
    }

    pub fn memory_enabled(&self) -> bool {
        self.memory_enabled
    }

    pub fn disk_enabled(&self) -> bool {
        self.disk_enabled
    }

    // -- Lookup -------------------------------------------------------------

    /// Probe memory first, then the disk metadata record.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        if !self.enabled {
            return Lookup::Miss;
        }

        if self.memory_enabled {
            if let Some(entry) = self.memory.get(key.as_hex()) {
                if now_ms() < entry.expires_at_ms {
                    entry.last_used_ms.store(now_ms(), Ordering::Relaxed);
                    return Lookup::MemoryHit {
                        data: entry.data.clone(),
                        headers: entry.headers.clone(),
                        etag: entry.etag.clone(),
                    };
                }
                drop(entry);
                self.remove_memory(key.as_hex());
            }
        }

        if self.disk_enabled {
            if let Some(meta) = self.read_disk_metadata(key).await {
                if chrono::Utc::now().timestamp() < meta.expires_at {
                    let path = self.data_path(key);
                    // Length check keeps a truncated or clobbered data file
                    // from being served.
                    match tokio::fs::metadata(&path).await {
                        Ok(m) if m.len() == meta.length => {
                            return Lookup::DiskHit { path, meta };
                        }
                        Ok(m) => {
                            warn!(
                                key = %key,
                                expected = meta.length,
                                actual = m.len(),
                                "disk entry length mismatch, dropping"
                            );
                            self.remove_disk(key).await;
                        }
                        Err(_) => {
                            self.remove_disk(key).await;
                        }
                    }
                } else {
                    self.remove_disk(key).await;
                }
            }
        }

        Lookup::Miss
    }

    // -- Memory tier --------------------------------------------------------

    /// Install a fully-read body into the memory tier. Oversized payloads are
    /// ignored; eviction runs before insert so the bounds hold afterwards.
    pub fn insert_memory(
        &self,
        key: &CacheKey,
        data: Bytes,
        headers: Vec<(String, String)>,
        etag: Option<String>,
        ttl: Duration,
    ) {
        if !self.memory_enabled || data.is_empty() {
            return;
        }
        let size = data.len() as u64;
        if size > self.max_memory_bytes {
            debug!(key = %key, size, "payload exceeds memory tier ceiling, not cached");
            return;
        }

        self.evict_for(size);

        let now = now_ms();
        let entry = MemoryEntry {
            data,
            headers,
            etag,
            expires_at_ms: now + ttl.as_millis() as u64,
            last_used_ms: AtomicU64::new(now),
        };

        // Last writer wins on concurrent installs for the same key.
        if let Some(old) = self.memory.insert(key.as_hex().to_string(), entry) {
            self.memory_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
        self.memory_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn remove_memory(&self, key_hex: &str) {
        if let Some((_, old)) = self.memory.remove(key_hex) {
            self.memory_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
    }

    /// Evict until `incoming` more bytes and one more entry fit. Order is
    /// least-recently-used first, ties broken by smaller size first.
    fn evict_for(&self, incoming: u64) {
        let over_entries = |len: usize| len + 1 > self.max_memory_entries;
        let over_bytes = |bytes: u64| bytes + incoming > self.max_memory_bytes;

        if !over_entries(self.memory.len()) && !over_bytes(self.memory_bytes.load(Ordering::Relaxed))
        {
            return;
        }

        let mut candidates: Vec<(String, u64, u64)> = self
            .memory
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.last_used_ms.load(Ordering::Relaxed),
                    e.data.len() as u64,
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        for (key_hex, _, _) in candidates {
            if !over_entries(self.memory.len())
                && !over_bytes(self.memory_bytes.load(Ordering::Relaxed))
            {
                break;
            }
            self.remove_memory(&key_hex);
        }
    }

    // -- Disk tier ----------------------------------------------------------

    pub fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.disk_root
            .join(key.shard())
            .join(format!("{}.bin", key.as_hex()))
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.disk_root
            .join(key.shard())
            .join(format!("{}.json", key.as_hex()))
    }

    /// Temporary path used while a population tee is in flight.
    pub fn tmp_path(&self, key: &CacheKey) -> PathBuf {
        self.disk_root
            .join(key.shard())
            .join(format!("{}.tmp", key.as_hex()))
    }

    async fn read_disk_metadata(&self, key: &CacheKey) -> Option<DiskMetadata> {
        let raw = tokio::fs::read(self.meta_path(key)).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(key = %key, error = %e, "unreadable disk metadata record, dropping");
                self.remove_disk(key).await;
                None
            }
        }
    }

    /// Commit a fully-written temporary file into the disk tier: rename the
    /// data into place first, then write the metadata record (also via
    /// temp-and-rename), so metadata is visible only once data is durable.
    pub async fn commit_disk(
        &self,
        key: &CacheKey,
        tmp: &Path,
        headers: Vec<(String, String)>,
        etag: Option<String>,
        length: u64,
        ttl: Duration,
    ) -> Result<()> {
        let data_path = self.data_path(key);
        tokio::fs::rename(tmp, &data_path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), data_path.display()))?;

        let meta = DiskMetadata {
            headers,
            etag,
            length,
            expires_at: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
        };
        let meta_path = self.meta_path(key);
        let meta_tmp = meta_path.with_extension("json.tmp");
        tokio::fs::write(&meta_tmp, serde_json::to_vec(&meta)?)
            .await
            .with_context(|| format!("write metadata {}", meta_tmp.display()))?;
        tokio::fs::rename(&meta_tmp, &meta_path)
            .await
            .with_context(|| format!("rename {} -> {}", meta_tmp.display(), meta_path.display()))?;

        debug!(key = %key, length, "disk entry committed");
        Ok(())
    }

    /// Remove both files of a disk entry. Metadata goes first so a crashed
    /// removal never leaves metadata pointing at nothing.
    pub async fn remove_disk(&self, key: &CacheKey) {
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
        let _ = tokio::fs::remove_file(self.data_path(key)).await;
    }

    // -- Sweeper ------------------------------------------------------------

    /// Spawn the background task that removes expired entries from both tiers
    /// at the configured interval and keeps the disk tier under its byte
    /// ceiling.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cache.cleanup_interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                cache.sweep_memory();
                if cache.disk_enabled {
                    if let Err(e) = cache.sweep_disk().await {
                        warn!(error = %e, "disk cache sweep failed");
                    }
                }
            }
        });
    }

    fn sweep_memory(&self) {
        let now = now_ms();
        let expired: Vec<String> = self
            .memory
            .iter()
            .filter(|e| e.expires_at_ms <= now)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key_hex in expired {
            self.remove_memory(&key_hex);
        }
        if count > 0 {
            debug!(removed = count, remaining = self.memory.len(), "memory sweep");
        }
    }

    /// Walk the disk layout, drop expired or orphaned records, then enforce
    /// the byte ceiling by evicting entries closest to expiry.
    async fn sweep_disk(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut live: Vec<(PathBuf, PathBuf, u64, i64)> = Vec::new();
        let mut total: u64 = 0;

        let mut shards = match tokio::fs::read_dir(&self.disk_root).await {
            Ok(rd) => rd,
            Err(_) => return Ok(()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();

                if name.ends_with(".json") {
                    let data_path = path.with_extension("bin");
                    let meta: Option<DiskMetadata> = tokio::fs::read(&path)
                        .await
                        .ok()
                        .and_then(|raw| serde_json::from_slice(&raw).ok());
                    match meta {
                        Some(meta) if meta.expires_at > now && data_path.exists() => {
                            total += meta.length;
                            live.push((path, data_path, meta.length, meta.expires_at));
                        }
                        _ => {
                            let _ = tokio::fs::remove_file(&path).await;
                            let _ = tokio::fs::remove_file(&data_path).await;
                        }
                    }
                } else if name.ends_with(".bin") {
                    // Orphaned data file: no metadata record means it was
                    // never committed or its metadata was swept.
                    if !path.with_extension("json").exists() {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                } else if name.ends_with(".tmp") {
                    // Leftover from a crashed or abandoned tee. Anything that
                    // has survived a full sweep interval is dead.
                    if let Ok(meta) = entry.metadata().await {
                        if let Ok(modified) = meta.modified() {
                            if modified.elapsed().unwrap_or_default() > self.cleanup_interval {
                                let _ = tokio::fs::remove_file(&path).await;
                            }
                        }
                    }
                }
            }
        }

        if total > self.max_disk_bytes {
            live.sort_by_key(|(_, _, _, expires_at)| *expires_at);
            for (meta_path, data_path, length, _) in live {
                if total <= self.max_disk_bytes {
                    break;
                }
                let _ = tokio::fs::remove_file(&meta_path).await;
                let _ = tokio::fs::remove_file(&data_path).await;
                total = total.saturating_sub(length);
            }
            debug!(total, ceiling = self.max_disk_bytes, "disk sweep trimmed to ceiling");
        }

        Ok(())
    }

    /// Ensure the shard directory for `key` exists and return it.
    pub async fn ensure_shard_dir(&self, key: &CacheKey) -> Result<()> {
        let dir = self.disk_root.join(key.shard());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create shard dir: {}", dir.display()))
    }

    #[cfg(test)]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_config(dir: &Path) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.disk_path = dir.to_string_lossy().into_owned();
        config
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(ArtifactKind::Raw, "o", "r", "main", name, "")
    }

    #[tokio::test]
    async fn miss_then_memory_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();
        let k = key("/a");

        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));

        cache.insert_memory(
            &k,
            Bytes::from_static(b"hello"),
            vec![("Content-Type".into(), "text/plain".into())],
            Some("\"abc\"".into()),
            Duration::from_secs(60),
        );

        match cache.lookup(&k).await {
            Lookup::MemoryHit { data, headers, etag } => {
                assert_eq!(&data[..], b"hello");
                assert_eq!(headers[0].1, "text/plain");
                assert_eq!(etag.as_deref(), Some("\"abc\""));
            }
            _ => panic!("expected memory hit"),
        }
    }

    #[tokio::test]
    async fn expired_memory_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();
        let k = key("/b");
        cache.insert_memory(&k, Bytes::from_static(b"x"), vec![], None, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));
        assert_eq!(cache.memory_len(), 0);
    }

    #[tokio::test]
    async fn memory_eviction_is_lru_with_size_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_memory_entries = 2;
        let cache = Cache::new(&config).await.unwrap();

        let (k1, k2, k3) = (key("/1"), key("/2"), key("/3"));
        cache.insert_memory(&k1, Bytes::from_static(b"one"), vec![], None, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.insert_memory(&k2, Bytes::from_static(b"two"), vec![], None, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch k1 so k2 becomes the LRU victim.
        assert!(matches!(cache.lookup(&k1).await, Lookup::MemoryHit { .. }));
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.insert_memory(&k3, Bytes::from_static(b"three"), vec![], None, Duration::from_secs(60));

        assert!(matches!(cache.lookup(&k1).await, Lookup::MemoryHit { .. }));
        assert!(matches!(cache.lookup(&k2).await, Lookup::Miss));
        assert!(matches!(cache.lookup(&k3).await, Lookup::MemoryHit { .. }));
    }

    #[tokio::test]
    async fn oversized_payload_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_memory_size = 4;
        let cache = Cache::new(&config).await.unwrap();
        let k = key("/big");
        cache.insert_memory(
            &k,
            Bytes::from_static(b"too large"),
            vec![],
            None,
            Duration::from_secs(60),
        );
        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));
    }

    #[tokio::test]
    async fn disk_commit_then_hit_with_length_check() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();
        let k = key("/disk");

        cache.ensure_shard_dir(&k).await.unwrap();
        let tmp = cache.tmp_path(&k);
        tokio::fs::write(&tmp, b"archive-bytes").await.unwrap();
        cache
            .commit_disk(&k, &tmp, vec![("Content-Type".into(), "application/zip".into())], None, 13, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!tmp.exists());

        match cache.lookup(&k).await {
            Lookup::DiskHit { path, meta } => {
                assert_eq!(meta.length, 13);
                assert_eq!(tokio::fs::read(&path).await.unwrap(), b"archive-bytes");
            }
            _ => panic!("expected disk hit"),
        }
    }

    #[tokio::test]
    async fn truncated_disk_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();
        let k = key("/trunc");

        cache.ensure_shard_dir(&k).await.unwrap();
        let tmp = cache.tmp_path(&k);
        tokio::fs::write(&tmp, b"full-body").await.unwrap();
        cache
            .commit_disk(&k, &tmp, vec![], None, 9, Duration::from_secs(60))
            .await
            .unwrap();

        // Clobber the data file behind the cache's back.
        tokio::fs::write(cache.data_path(&k), b"oops").await.unwrap();

        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));
        assert!(!cache.meta_path(&k).exists());
    }

    #[tokio::test]
    async fn expired_disk_entry_is_removed_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();
        let k = key("/expired");

        cache.ensure_shard_dir(&k).await.unwrap();
        let tmp = cache.tmp_path(&k);
        tokio::fs::write(&tmp, b"stale").await.unwrap();
        cache
            .commit_disk(&k, &tmp, vec![], None, 5, Duration::ZERO)
            .await
            .unwrap();

        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));
        assert!(!cache.data_path(&k).exists());
    }

    #[tokio::test]
    async fn disk_sweep_removes_orphans_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&test_config(dir.path())).await.unwrap();

        let expired = key("/sweep-expired");
        cache.ensure_shard_dir(&expired).await.unwrap();
        let tmp = cache.tmp_path(&expired);
        tokio::fs::write(&tmp, b"old").await.unwrap();
        cache
            .commit_disk(&expired, &tmp, vec![], None, 3, Duration::ZERO)
            .await
            .unwrap();

        let orphan = key("/sweep-orphan");
        cache.ensure_shard_dir(&orphan).await.unwrap();
        tokio::fs::write(cache.data_path(&orphan), b"no-meta").await.unwrap();

        let live = key("/sweep-live");
        cache.ensure_shard_dir(&live).await.unwrap();
        let tmp = cache.tmp_path(&live);
        tokio::fs::write(&tmp, b"fresh").await.unwrap();
        cache
            .commit_disk(&live, &tmp, vec![], None, 5, Duration::from_secs(600))
            .await
            .unwrap();

        cache.sweep_disk().await.unwrap();

        assert!(!cache.data_path(&expired).exists());
        assert!(!cache.data_path(&orphan).exists());
        assert!(cache.data_path(&live).exists());
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.enabled = false;
        let cache = Cache::new(&config).await.unwrap();
        let k = key("/off");
        cache.insert_memory(&k, Bytes::from_static(b"x"), vec![], None, Duration::from_secs(60));
        assert!(matches!(cache.lookup(&k).await, Lookup::Miss));
    }
}
