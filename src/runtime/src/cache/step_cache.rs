//! Step cache: `(parent image, step, file digests)` → resulting image.
//!
//! Entries live in memory and are optionally persisted as
//! `<cache_dir>/steps.json` so later runs can skip work already done.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use box_core::error::{BoxError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::plan::Verb;

/// File holding persisted entries inside the cache directory.
pub const CACHE_FILE: &str = "steps.json";

/// Deterministic digest identifying one step applied to one parent image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute a key.
    ///
    /// `material` is the resolved step plus its execution context; serde_json
    /// maps are ordered, so its serialization is canonical.
    pub fn compute(
        parent: &str,
        verb: Verb,
        material: &serde_json::Value,
        file_digests: &[String],
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(b"box-step-v1\n");
        hasher.update(parent.as_bytes());
        hasher.update(b"\n");
        hasher.update(verb.name().as_bytes());
        hasher.update(b"\n");
        hasher.update(serde_json::to_vec(material)?);
        hasher.update(b"\n");
        for digest in file_digests {
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cached step result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Image produced by the step
    pub image: String,
    /// When the entry was stored
    pub created_at: DateTime<Utc>,
}

/// Counters for one cache store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub lookups: usize,
    pub hits: usize,
    pub misses: usize,
    pub stores: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Keys dropped since the last flush; kept out of the merged file
    invalidated: HashSet<String>,
    stats: CacheStats,
    dirty: bool,
}

/// Step cache store.
pub struct StepCache {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl StepCache {
    /// Cache that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
        }
    }

    /// Open (or create) a persisted cache under `cache_dir`.
    ///
    /// An unreadable cache file is logged and ignored.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to create step cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        let path = cache_dir.join(CACHE_FILE);
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable step cache");
                HashMap::new()
            }
        };

        tracing::debug!(
            path = %path.display(),
            entries = entries.len(),
            "Opened step cache"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                entries,
                ..Default::default()
            }),
            path: Some(path),
        })
    }

    /// Look a key up, counting the lookup and its outcome.
    pub fn lookup(&self, key: &CacheKey) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.stats.lookups += 1;
        let image = inner.entries.get(key.as_str()).map(|e| e.image.clone());
        if image.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        image
    }

    pub fn store(&self, key: &CacheKey, image: &str) {
        let mut inner = self.inner.lock();
        inner.invalidated.remove(key.as_str());
        inner.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                image: image.to_string(),
                created_at: Utc::now(),
            },
        );
        inner.stats.stores += 1;
        inner.dirty = true;
    }

    /// Drop an entry whose image has disappeared; the hit that found it is
    /// recounted as a miss.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key.as_str()).is_some() {
            inner.invalidated.insert(key.as_str().to_string());
            inner.dirty = true;
            if inner.stats.hits > 0 {
                inner.stats.hits -= 1;
                inner.stats.misses += 1;
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key.as_str()).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist entries, merged over whatever another run wrote meanwhile.
    ///
    /// The file is replaced atomically. No-op for in-memory caches or when
    /// nothing changed.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }

        let mut merged = read_entries(path).unwrap_or_default();
        for key in &inner.invalidated {
            merged.remove(key);
        }
        for (key, entry) in &inner.entries {
            merged.insert(key.clone(), entry.clone());
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let data = serde_json::to_vec_pretty(&merged)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to create temporary cache file in {}: {}",
                dir.display(),
                e
            ))
        })?;
        tmp.write_all(&data)?;
        tmp.persist(path).map_err(|e| {
            BoxError::CacheError(format!(
                "Failed to write step cache {}: {}",
                path.display(),
                e.error
            ))
        })?;

        inner.invalidated.clear();
        inner.dirty = false;
        tracing::debug!(path = %path.display(), entries = merged.len(), "Flushed step cache");
        Ok(())
    }
}

impl std::fmt::Debug for StepCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCache")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}

fn read_entries(path: &Path) -> Result<HashMap<String, CacheEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
