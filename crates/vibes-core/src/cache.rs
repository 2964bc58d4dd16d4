//! Filesystem cache for external-call results.
//!
//! Layout: `<root>/<namespace>/<sha256(key)>.json`, each file holding a
//! [`CacheEntry`]. Writes land in a uniquely named temp file that is renamed
//! over the target, so readers see either the old entry or the new one.
//! A bounded in-memory layer fronts the files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::compute_hash;
use crate::traits::CacheStore;

const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;

/// Logical partition of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Listing-service responses.
    RawFetch,
    /// Enrichment-service responses.
    Enrichment,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::RawFetch, Namespace::Enrichment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::RawFetch => "raw",
            Namespace::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" | "raw_fetch" | "raw-fetch" => Ok(Namespace::RawFetch),
            "enrichment" => Ok(Namespace::Enrichment),
            _ => Err(format!("Unknown cache namespace: {}", s)),
        }
    }
}

/// One cached result. The key is stored alongside the data so a hash
/// collision or a misplaced file is detected on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub cached_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Hit/miss counters for the lifetime of one [`FsCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    /// Percentage of lookups served from cache.
    pub fn hit_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.hits as f64 / self.total() as f64 * 100.0
        }
    }
}

/// On-disk footprint of one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NamespaceStats {
    pub entries: u64,
    pub bytes: u64,
}

struct Inner {
    root: PathBuf,
    memory: Cache<(Namespace, String), CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Durable [`CacheStore`] backed by one JSON file per key.
#[derive(Clone)]
pub struct FsCache {
    inner: Arc<Inner>,
}

impl FsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_memory_capacity(root, DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_memory_capacity(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                memory: Cache::builder().max_capacity(capacity).build(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.inner.root.join(namespace.as_str())
    }

    fn entry_path(&self, namespace: Namespace, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.json", compute_hash(key)))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Count and total size of the entry files in `namespace`.
    pub async fn namespace_stats(&self, namespace: Namespace) -> Result<NamespaceStats, AppError> {
        let mut stats = NamespaceStats::default();
        let mut dir = match tokio::fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !is_entry_file(&entry.path()) {
                continue;
            }
            stats.entries += 1;
            stats.bytes += entry.metadata().await?.len();
        }
        Ok(stats)
    }

    /// Delete every entry in `namespace` (all namespaces if `None`).
    /// Returns the number of entries removed.
    pub async fn clear(&self, namespace: Option<Namespace>) -> Result<u64, AppError> {
        let targets = match namespace {
            Some(ns) => vec![ns],
            None => Namespace::ALL.to_vec(),
        };

        let mut removed = 0;
        for ns in targets {
            let mut dir = match tokio::fs::read_dir(self.namespace_dir(ns)).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if is_entry_file(&path) {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
            tracing::info!(namespace = %ns, "Cache namespace cleared");
        }

        self.inner.memory.invalidate_all();
        Ok(removed)
    }

    async fn read_entry(&self, namespace: Namespace, key: &str) -> Result<Option<CacheEntry>, AppError> {
        let path = self.entry_path(namespace, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::CacheCorruption(format!("{}: {e}", path.display()))
        })?;
        if entry.key != key {
            return Err(AppError::CacheCorruption(format!(
                "{}: stored key '{}' does not match '{key}'",
                path.display(),
                entry.key
            )));
        }
        Ok(Some(entry))
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

impl CacheStore for FsCache {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<CacheEntry>, AppError> {
        let memory_key = (namespace, key.to_string());
        if let Some(entry) = self.inner.memory.get(&memory_key).await {
            self.record_lookup(true);
            return Ok(Some(entry));
        }

        let entry = match self.read_entry(namespace, key).await {
            Ok(entry) => entry,
            Err(AppError::CacheCorruption(detail)) => {
                tracing::warn!(%namespace, %key, %detail, "Corrupt cache entry, treating as miss");
                None
            }
            Err(e) => return Err(e),
        };

        self.record_lookup(entry.is_some());
        if let Some(entry) = &entry {
            self.inner.memory.insert(memory_key, entry.clone()).await;
        }
        Ok(entry)
    }

    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), AppError> {
        let entry = CacheEntry {
            key: key.to_string(),
            cached_at: Utc::now(),
            data: value.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;
        let target = self.entry_path(namespace, key);
        let temp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));

        tokio::fs::write(&temp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tracing::debug!(%namespace, %key, bytes = bytes.len(), "Cache entry written");
        self.inner
            .memory
            .insert((namespace, key.to_string()), entry)
            .await;
        Ok(())
    }

    async fn prune<F>(&self, namespace: Namespace, expired: F) -> Result<u64, AppError>
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync,
    {
        let mut dir = match tokio::fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if !is_entry_file(&path) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let entry: CacheEntry = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable cache entry, left in place");
                    continue;
                }
            };
            if !expired(&entry) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            self.inner.memory.invalidate(&(namespace, entry.key)).await;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(%namespace, removed, "Expired cache entries pruned");
        }
        Ok(removed)
    }
}
