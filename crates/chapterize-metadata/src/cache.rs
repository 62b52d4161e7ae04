//! Per-ASIN TTL cache for catalog responses.
//!
//! Cache files are verbatim JSON as returned by the upstream client, written
//! only on success — error responses are never cached. TTL is judged by file
//! mtime, not an embedded timestamp, so the cache needs no bookkeeping beyond
//! the file itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};

/// Which kind of payload a cache entry holds, distinguishing the two
/// filenames a book can have (`_book_` and `_chapters_`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Book,
    Chapters,
}

impl CacheKind {
    fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Book => "book",
            CacheKind::Chapters => "chapters",
        }
    }
}

/// A TTL-gated cache directory shared by the primary and fallback clients.
/// Each client is keyed by its own `source` prefix so the two never collide
/// even when both cache the same ASIN.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    dir: PathBuf,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    fn path(&self, source: &str, kind: CacheKind, asin: &str) -> PathBuf {
        self.dir
            .join(format!("{source}_{}_{asin}.json", kind.as_str()))
    }

    /// Read a cached entry if present and within TTL. `force_refresh` skips
    /// the cache outright without deleting the file, so a
    /// failed refetch still leaves the old entry available for next time.
    pub fn get<T: DeserializeOwned>(
        &self,
        source: &str,
        kind: CacheKind,
        asin: &str,
        force_refresh: bool,
    ) -> Result<Option<T>> {
        if force_refresh {
            return Ok(None);
        }
        let path = self.path(source, kind, asin);
        let Ok(metadata) = fs::metadata(&path) else {
            return Ok(None);
        };
        let Ok(modified) = metadata.modified() else {
            return Ok(None);
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > self.ttl {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache file {}", path.display()))?;
        let value: T = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse cached JSON at {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write a successful response verbatim. Never called for error
    /// responses.
    pub fn put<T: Serialize>(&self, source: &str, kind: CacheKind, asin: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        let path = self.path(source, kind, asin);
        let json = serde_json::to_string_pretty(value).context("failed to serialize cache entry")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write cache file {}", path.display()))?;
        Ok(())
    }

    pub fn path_for(&self, source: &str, kind: CacheKind, asin: &str) -> PathBuf {
        self.path(source, kind, asin)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
