//! Manifest persistence for resumable audiobook pipeline runs.
//!
//! A manifest is the single source of truth for one book's progress: which
//! stage it is on, what it has discovered (ASIN, cached catalog metadata),
//! and its retry history. It is read and rewritten on every stage
//! transition, always via temp-file-then-rename so a reader never observes
//! a torn document (invariant 2).
//!
//! # Example
//!
//! ```
//! use chapterize_state::ManifestStore;
//! use chapterize_types::Mode;
//! use std::path::Path;
//!
//! let store = ManifestStore::new(Path::new("/tmp/chapterize-manifests"));
//! let manifest = store.create("abc0123456789def", Path::new("/in/BookDir"), Mode::Convert)
//! .expect("create");
//! assert_eq!(manifest.next_pending_stage, Some(chapterize_types::StageName::Validate));
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chapterize_types::{
    AsinSource, BookHash, ErrorCategory, ErrorContext, ManifestStatus, Mode, NormalizedBook,
    StageName, StageStatus,
};

/// Record of one stage's progress within a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Stage-specific scalars that don't warrant their own field:
    /// `file_count`/`total_duration_s` for validate, `chapter_count` for
    /// convert, and so on. Kept loose so new stages don't need a schema
    /// migration to record a new fact.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StageRecord {
    fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            completed_at: None,
            output_path: None,
            extra: serde_json::Map::new(),
        }
    }

    fn completed() -> Self {
        Self {
            status: StageStatus::Completed,
            completed_at: Some(Utc::now()),
            output_path: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Cross-stage discovered data ( `metadata` field).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asin_source: Option<AsinSource>,
    /// The last normalized catalog payload fetched for this book, cached
    /// here so the organize stage can build the Plex path without refetching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedBook>,
}

/// One book's full persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub book_hash: BookHash,
    pub source_path: PathBuf,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub status: ManifestStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorContext>,
    pub stages: BTreeMap<StageName, StageRecord>,
    #[serde(default)]
    pub metadata: BookMetadata,
}

impl Manifest {
    fn new(book_hash: BookHash, source_path: PathBuf, mode: Mode, max_retries: u32) -> Self {
        let mut stages = BTreeMap::new();
        let prefilled = StageName::prefilled_for_mode(mode);
        for stage in StageName::CANONICAL_ORDER {
            let record = if prefilled.contains(&stage) {
                StageRecord::completed()
            } else {
                StageRecord::pending()
            };
            stages.insert(stage, record);
        }

        Self {
            book_hash,
            source_path,
            mode,
            created_at: Utc::now(),
            status: ManifestStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            stages,
            metadata: BookMetadata::default(),
        }
    }

    /// `status == completed` implies every stage in canonical order is
    /// `completed` (invariant). True only when actually so.
    pub fn is_complete(&self) -> bool {
        self.status == ManifestStatus::Completed
            && StageName::CANONICAL_ORDER
                .iter()
                .all(|s| self.stage_status(*s) == StageStatus::Completed)
    }

    pub fn stage_status(&self, stage: StageName) -> StageStatus {
        self.stages
            .get(&stage)
            .map(|r| r.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// First stage in canonical order that is not `completed`, or `None` if
    /// every stage is done.
    pub fn next_pending_stage(&self) -> Option<StageName> {
        StageName::CANONICAL_ORDER
            .into_iter()
            .find(|s| self.stage_status(*s) != StageStatus::Completed)
    }

    /// Reset any `failed` stage back to `pending` at the start of a retry
    /// run, so [`next_pending_stage`](Self::next_pending_stage) resumes at
    /// the stage that actually failed rather than skipping past it.
    pub fn rewind_failed_stages(&mut self) {
        for record in self.stages.values_mut() {
            if record.status == StageStatus::Failed {
                record.status = StageStatus::Pending;
            }
        }
    }

    pub fn mark_stage_completed(&mut self, stage: StageName) {
        let record = self.stages.entry(stage).or_insert_with(StageRecord::pending);
        record.status = StageStatus::Completed;
        record.completed_at = Some(Utc::now());
    }

    pub fn mark_stage_completed_with(
        &mut self,
        stage: StageName,
        output_path: Option<PathBuf>,
        extra: serde_json::Map<String, serde_json::Value>,
    ) {
        let record = self.stages.entry(stage).or_insert_with(StageRecord::pending);
        record.status = StageStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.output_path = output_path;
        record.extra = extra;
    }

    pub fn mark_stage_failed(&mut self, stage: StageName) {
        let record = self.stages.entry(stage).or_insert_with(StageRecord::pending);
        record.status = StageStatus::Failed;
    }

    /// Record a failure and bump the retry counter. Returns whether the book
    /// should now be quarantined (`retry_count` has reached `max_retries`),
    /// per the pipeline contract. Permanent errors always quarantine regardless of
    /// count; callers should check `error.category` before deciding whether
    /// to call this versus quarantining immediately.
    pub fn record_failure(&mut self, stage: StageName, error: ErrorContext) -> bool {
        self.mark_stage_failed(stage);
        let permanent = error.category == ErrorCategory::Permanent;
        self.last_error = Some(error);
        self.status = ManifestStatus::Failed;
        if permanent {
            return true;
        }
        self.retry_count += 1;
        self.retry_count >= self.max_retries
    }
}

/// Error returned when a mutation targets a book with no manifest on disk.
#[derive(Debug, thiserror::Error)]
#[error("no manifest found for book hash {0}")]
pub struct ManifestMissing(pub BookHash);

/// Persistent store for per-book manifests, one JSON document per hash.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(manifest_dir: &Path) -> Self {
        Self {
            dir: manifest_dir.to_path_buf(),
        }
    }

    pub fn manifest_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    /// Create a brand-new manifest and persist it. Does not check whether
    /// one already exists; callers decide create-vs-reuse via [`read`](Self::read).
    pub fn create(&self, hash: &str, source_path: &Path, mode: Mode) -> Result<Manifest> {
        self.create_with_retries(hash, source_path, mode, DEFAULT_MAX_RETRIES)
    }

    pub fn create_with_retries(
        &self,
        hash: &str,
        source_path: &Path,
        mode: Mode,
        max_retries: u32,
    ) -> Result<Manifest> {
        let manifest = Manifest::new(hash.to_string(), source_path.to_path_buf(), mode, max_retries);
        self.save(&manifest)?;
        Ok(manifest)
    }

    /// Read a manifest. A missing file is not an error: it means this is a
    /// new book.
    pub fn read(&self, hash: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse manifest JSON from {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Serialize and atomically persist a manifest: write to a sibling
    /// `<hash>.json.tmp.<pid>` then rename over the final path, so readers
    /// never observe a torn write.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create manifest dir {}", self.dir.display()))?;

        let path = self.manifest_path(&manifest.book_hash);
        let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));

        let json =
            serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write manifest tmp file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename manifest into place at {}", path.display()))?;
        Ok(())
    }

    /// Read-modify-write a manifest under the store's atomic-save contract.
    /// Fails with [`ManifestMissing`] if no manifest exists for `hash`.
    pub fn update(&self, hash: &str, patch: impl FnOnce(&mut Manifest)) -> Result<Manifest> {
        let mut manifest = self
            .read(hash)?
            .ok_or_else(|| ManifestMissing(hash.to_string()))?;
        patch(&mut manifest);
        self.save(&manifest)?;
        Ok(manifest)
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_prepopulates_all_eight_stages() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let m = store.create("hash1", Path::new("/in/Book"), Mode::Convert).unwrap();
        assert_eq!(m.stages.len(), 8);
        for stage in StageName::CANONICAL_ORDER {
            assert_eq!(m.stage_status(stage), StageStatus::Pending);
        }
    }

    #[test]
    fn create_enrich_prefills_first_three_stages() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let m = store.create("hash2", Path::new("/in/book.m4b"), Mode::Enrich).unwrap();
        assert_eq!(m.stage_status(StageName::Validate), StageStatus::Completed);
        assert_eq!(m.stage_status(StageName::Concat), StageStatus::Completed);
        assert_eq!(m.stage_status(StageName::Convert), StageStatus::Completed);
        assert_eq!(m.stage_status(StageName::Asin), StageStatus::Pending);
        assert_eq!(m.next_pending_stage(), Some(StageName::Asin));
    }

    #[test]
    fn read_missing_manifest_returns_none() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        assert!(store.read("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn save_then_read_roundtrips() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let created = store.create("hash3", Path::new("/in/Book"), Mode::Convert).unwrap();
        let loaded = store.read("hash3").unwrap().unwrap();
        assert_eq!(loaded.book_hash, created.book_hash);
        assert_eq!(loaded.source_path, created.source_path);
    }

    #[test]
    fn update_on_unknown_hash_fails() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let err = store.update("nope", |_| {}).unwrap_err();
        assert!(err.downcast_ref::<ManifestMissing>().is_some());
    }

    #[test]
    fn update_applies_patch_and_persists() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        store.create("hash4", Path::new("/in/Book"), Mode::Convert).unwrap();

        store
            .update("hash4", |m| m.mark_stage_completed(StageName::Validate))
            .unwrap();

        let reloaded = store.read("hash4").unwrap().unwrap();
        assert_eq!(reloaded.stage_status(StageName::Validate), StageStatus::Completed);
        assert_eq!(reloaded.next_pending_stage(), Some(StageName::Concat));
    }

    #[test]
    fn next_pending_stage_is_none_once_all_completed() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let mut m = store.create("hash5", Path::new("/in/Book"), Mode::Convert).unwrap();
        for stage in StageName::CANONICAL_ORDER {
            m.mark_stage_completed(stage);
        }
        assert_eq!(m.next_pending_stage(), None);
    }

    #[test]
    fn rewind_failed_stages_resets_only_failed() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let mut m = store.create("hash6", Path::new("/in/Book"), Mode::Convert).unwrap();
        m.mark_stage_completed(StageName::Validate);
        m.mark_stage_failed(StageName::Concat);

        m.rewind_failed_stages();

        assert_eq!(m.stage_status(StageName::Validate), StageStatus::Completed);
        assert_eq!(m.stage_status(StageName::Concat), StageStatus::Pending);
        assert_eq!(m.next_pending_stage(), Some(StageName::Concat));
    }

    #[test]
    fn record_failure_transient_increments_retry_until_exhausted() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let mut m = store
            .create_with_retries("hash7", Path::new("/in/Book"), Mode::Convert, 2)
            .unwrap();

        let err = ErrorContext {
            stage: StageName::Convert,
            timestamp: Utc::now(),
            exit_code: Some(137),
            message: "oom".to_string(),
            category: ErrorCategory::Transient,
        };

        assert!(!m.record_failure(StageName::Convert, err.clone()));
        assert_eq!(m.retry_count, 1);
        assert!(m.record_failure(StageName::Convert, err));
        assert_eq!(m.retry_count, 2);
    }

    #[test]
    fn record_failure_permanent_quarantines_immediately() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let mut m = store.create("hash8", Path::new("/in/Book"), Mode::Convert).unwrap();

        let err = ErrorContext {
            stage: StageName::Validate,
            timestamp: Utc::now(),
            exit_code: Some(2),
            message: "no audio files".to_string(),
            category: ErrorCategory::Permanent,
        };

        assert!(m.record_failure(StageName::Validate, err));
        assert_eq!(m.retry_count, 0);
    }

    #[test]
    fn is_complete_requires_status_and_all_stages_completed() {
        let td = tempdir().unwrap();
        let store = ManifestStore::new(td.path());
        let mut m = store.create("hash9", Path::new("/in/Book"), Mode::Convert).unwrap();
        assert!(!m.is_complete());
        for stage in StageName::CANONICAL_ORDER {
            m.mark_stage_completed(stage);
        }
        assert!(!m.is_complete());
        m.status = ManifestStatus::Completed;
        assert!(m.is_complete());
    }
}
