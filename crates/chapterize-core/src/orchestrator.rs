//! Top-level pipeline state machine : acquire the
//! lock, load or create the manifest, then drive stages in canonical order
//! until the book is complete, a permanent failure quarantines it, or the
//! transient retry budget runs out. Every exit path other than a crash goes
//! through here, so the CLI only has to map [`RunOutcome`] to an exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chapterize_config::Config;
use chapterize_metadata::{FallbackAggregatorClient, MetadataCache, PrimaryCatalogClient};
use chapterize_state::{Manifest, ManifestStore};
use chapterize_types::{ErrorContext, ManifestStatus, Mode, StageName};

use crate::errors::classify_stage_error;
use crate::logging::{Level, Reporter};
use crate::process::Runner;
use crate::stages::{self, PipelineContext};

/// What the orchestrator decided to do with the run, for the CLI to map to
/// an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    AlreadyComplete,
    LockContended,
    RetryLater,
    Quarantined,
}

pub struct RunRequest<'a> {
    pub source: &'a Path,
    pub mode: Option<Mode>,
    pub asin_override: Option<&'a str>,
    pub config: &'a Config,
    pub dry_run: bool,
    pub no_lock: bool,
    pub force: bool,
}

/// Run one book to completion or to its next stopping point. The caller
/// supplies everything environment-specific (config, dry-run, lock opt-out);
/// this function owns locking, manifest lifecycle, stage dispatch, and
/// failure bookkeeping.
pub fn run(request: &RunRequest<'_>) -> Result<RunOutcome> {
    let reporter = Reporter::new(&request.config.paths.log_dir, Level::from_config_str(&request.config.behavior.log_level));

    let _lock = if request.no_lock {
        None
    } else {
        match crate::lock::try_acquire_global(&request.config.paths.lock_dir)? {
            Some(guard) => Some(guard),
            None => {
                reporter.info("lock", "----------------", "pipeline lock contended; another run is active, exiting");
                return Ok(RunOutcome::LockContended);
            }
        }
    };

    let book_hash = crate::hash::book_hash(request.source)
        .with_context(|| format!("failed to hash {}", request.source.display()))?;
    let work_dir = request.config.paths.work_dir.join(&book_hash);
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("failed to create work dir {}", work_dir.display()))?;

    let store = ManifestStore::new(&request.config.paths.manifest_dir);
    let mode = request.mode.unwrap_or_else(|| {
        let ext = request.source.extension().and_then(|e| e.to_str());
        Mode::detect(request.source.is_dir(), ext)
    });

    let mut manifest = match store.read(&book_hash)? {
        Some(existing) if !request.force => existing,
        _ => store.create_with_retries(&book_hash, request.source, mode, request.config.retry.max_retries)?,
    };

    if manifest.is_complete() && !request.force {
        reporter.info("orchestrator", &book_hash, "book already fully processed, nothing to do");
        return Ok(RunOutcome::AlreadyComplete);
    }

    manifest.rewind_failed_stages();
    manifest.status = ManifestStatus::Running;
    store.save(&manifest)?;

    let (primary, fallback) = build_metadata_clients(request.config)?;
    let ctx = PipelineContext {
        config: request.config,
        runner: Runner::new(request.dry_run),
        reporter: &reporter,
        primary: &primary,
        fallback: &fallback,
    };

    while let Some(stage) = manifest.next_pending_stage() {
        reporter.info(stage.as_str(), &book_hash, "starting stage");
        match run_stage(&ctx, stage, &manifest, &work_dir, request.asin_override) {
            Ok(applied) => {
                apply_stage_success(&mut manifest, stage, applied);
                if stage == StageName::Cleanup {
                    manifest.status = ManifestStatus::Completed;
                }
                store.save(&manifest)?;
                reporter.info(stage.as_str(), &book_hash, "stage completed");
            }
            Err(error) => {
                return Ok(handle_stage_failure(
                    &ctx,
                    &mut manifest,
                    &store,
                    stage,
                    &error,
                    request.source,
                )?);
            }
        }
    }

    Ok(RunOutcome::Completed)
}

fn build_metadata_clients(config: &Config) -> Result<(PrimaryCatalogClient, FallbackAggregatorClient)> {
    let cache_ttl = Duration::from_secs(config.metadata.cache_days * 24 * 60 * 60);
    let cache_dir = config.paths.manifest_dir.join("metadata-cache");
    let primary = PrimaryCatalogClient::new(
        "https://api.audible.com",
        &config.metadata.audible_region,
        MetadataCache::new(&cache_dir, cache_ttl),
    )?;
    let fallback = FallbackAggregatorClient::new(
        "https://api.audnex.us",
        &config.metadata.audnexus_region,
        MetadataCache::new(&cache_dir, cache_ttl),
    )?;
    Ok((primary, fallback))
}

/// Classify, record, and (on quarantine) notify for one stage failure.
/// Returns the [`RunOutcome`] the caller should surface; the manifest is
/// already persisted by the time this returns.
fn handle_stage_failure(
    ctx: &PipelineContext<'_>,
    manifest: &mut Manifest,
    store: &ManifestStore,
    stage: StageName,
    error: &anyhow::Error,
    source: &Path,
) -> Result<RunOutcome> {
    let (category, exit_code, message) = classify_stage_error(error);
    ctx.reporter.error(stage.as_str(), &manifest.book_hash, &message);

    let error_context = ErrorContext {
        stage,
        timestamp: chrono::Utc::now(),
        exit_code,
        message: message.clone(),
        category,
    };
    let quarantine = manifest.record_failure(stage, error_context.clone());
    store.save(manifest)?;

    if !quarantine {
        return Ok(RunOutcome::RetryLater);
    }

    if !ctx.runner.dry_run {
        match crate::quarantine::quarantine(&ctx.config.paths.failed_dir, source, manifest, &error_context) {
            Ok(dest) => ctx.reporter.info(
                stage.as_str(),
                &manifest.book_hash,
                &format!("quarantined source to {}", dest.display()),
            ),
            Err(e) => ctx.reporter.error(
                stage.as_str(),
                &manifest.book_hash,
                &format!("failed to quarantine source: {e:#}"),
            ),
        }
    }

    if let Some(url) = &ctx.config.webhook.url {
        let payload = chapterize_webhook::FailurePayload {
            book_hash: manifest.book_hash.clone(),
            source_path: source.to_string_lossy().into_owned(),
            stage,
            category,
            exit_code,
            message,
            retry_count: manifest.retry_count,
            timestamp: chrono::Utc::now(),
        };
        let reporter = ctx.reporter;
        let book_hash = manifest.book_hash.clone();
        chapterize_webhook::notify_failure(url, &payload, |err| {
            reporter.warn("webhook", &book_hash, err);
        });
    }

    Ok(RunOutcome::Quarantined)
}

enum StageApplied {
    Validate(stages::ValidateOutcome),
    Concat(stages::ConcatOutcome),
    Convert(stages::ConvertOutcome),
    Asin(stages::AsinOutcome),
    Metadata(stages::MetadataOutcome),
    Organize(stages::OrganizeOutcome),
    Archive(stages::ArchiveOutcome),
    Cleanup,
}

fn run_stage(
    ctx: &PipelineContext<'_>,
    stage: StageName,
    manifest: &Manifest,
    work_dir: &Path,
    asin_override: Option<&str>,
) -> Result<StageApplied> {
    match stage {
        StageName::Validate => Ok(StageApplied::Validate(stages::run_validate(
            ctx,
            &manifest.book_hash,
            &manifest.source_path,
            work_dir,
        )?)),
        StageName::Concat => Ok(StageApplied::Concat(stages::run_concat(ctx, &manifest.source_path, work_dir)?)),
        StageName::Convert => Ok(StageApplied::Convert(stages::run_convert(ctx, manifest, work_dir)?)),
        StageName::Asin => Ok(StageApplied::Asin(stages::run_asin(ctx, manifest, asin_override)?)),
        StageName::Metadata => Ok(StageApplied::Metadata(stages::run_metadata(ctx, manifest, work_dir)?)),
        StageName::Organize => Ok(StageApplied::Organize(stages::run_organize(ctx, manifest)?)),
        StageName::Archive => Ok(StageApplied::Archive(stages::run_archive(ctx, manifest)?)),
        StageName::Cleanup => {
            stages::run_cleanup(ctx, work_dir)?;
            Ok(StageApplied::Cleanup)
        }
    }
}

fn apply_stage_success(manifest: &mut Manifest, stage: StageName, applied: StageApplied) {
    match applied {
        StageApplied::Validate(o) => {
            let mut extra = serde_json::Map::new();
            extra.insert("file_count".into(), serde_json::json!(o.file_count));
            extra.insert("source_bytes".into(), serde_json::json!(o.source_bytes));
            manifest.mark_stage_completed_with(stage, None, extra);
        }
        StageApplied::Concat(o) => {
            let mut extra = serde_json::Map::new();
            extra.insert("chapter_count".into(), serde_json::json!(o.chapter_count));
            if let Some(p) = &o.chapter_metadata {
                extra.insert("chapter_metadata".into(), serde_json::json!(p.to_string_lossy()));
            }
            if let Some(p) = &o.file_boundary_chapter_file {
                extra.insert("file_boundary_chapter_file".into(), serde_json::json!(p.to_string_lossy()));
            }
            extra.insert(
                "input_files".into(),
                serde_json::json!(
                    o.input_files
                        .iter()
                        .map(|p| p.to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                ),
            );
            manifest.mark_stage_completed_with(stage, Some(o.concat_list), extra);
        }
        StageApplied::Convert(o) => {
            let mut extra = serde_json::Map::new();
            extra.insert("duration_s".into(), serde_json::json!(o.duration_s));
            manifest.mark_stage_completed_with(stage, Some(o.output_path), extra);
        }
        StageApplied::Asin(o) => {
            if let Some(discovery) = &o.discovery {
                manifest.metadata.asin = Some(discovery.asin.clone());
                manifest.metadata.asin_source = Some(discovery.source);
            }
            manifest.mark_stage_completed(stage);
        }
        StageApplied::Metadata(o) => {
            manifest.metadata.normalized = o.book;
            let mut extra = serde_json::Map::new();
            if let Some(p) = &o.cover_path {
                extra.insert("cover_path".into(), serde_json::json!(p.to_string_lossy()));
            }
            if let Some(p) = &o.desc_path {
                extra.insert("desc_path".into(), serde_json::json!(p.to_string_lossy()));
            }
            if let Some(p) = &o.reader_path {
                extra.insert("reader_path".into(), serde_json::json!(p.to_string_lossy()));
            }
            manifest.mark_stage_completed_with(stage, Some(o.output_path), extra);
        }
        StageApplied::Organize(o) => {
            manifest.mark_stage_completed_with(stage, Some(o.deployed_path), serde_json::Map::new());
        }
        StageApplied::Archive(o) => {
            let mut extra = serde_json::Map::new();
            extra.insert("archived_to".into(), serde_json::json!(o.archived_to.to_string_lossy()));
            manifest.mark_stage_completed_with(stage, None, extra);
        }
        StageApplied::Cleanup => {
            manifest.mark_stage_completed(stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base_config(td: &Path) -> Config {
        let mut config = Config::default();
        config.paths.work_dir = td.join("work");
        config.paths.manifest_dir = td.join("manifests");
        config.paths.lock_dir = td.join("locks");
        config.paths.nfs_output_dir = td.join("library");
        config.paths.archive_dir = td.join("archive");
        config.paths.log_dir = td.join("logs");
        config
    }

    #[test]
    fn dry_run_convert_completes_all_eight_stages() {
        let td = tempdir().unwrap();
        let source = td.path().join("Andy Weir - Project Hail Mary");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"a").unwrap();
        std::fs::write(source.join("ch2.mp3"), b"b").unwrap();

        let config = base_config(td.path());
        let request = RunRequest {
            source: &source,
            mode: None,
            asin_override: None,
            config: &config,
            dry_run: true,
            no_lock: true,
            force: false,
        };

        let outcome = run(&request).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let store = ManifestStore::new(&config.paths.manifest_dir);
        let hash = crate::hash::book_hash(&source).unwrap();
        let manifest = store.read(&hash).unwrap().unwrap();
        assert!(manifest.is_complete());
    }

    #[test]
    fn already_complete_book_short_circuits() {
        let td = tempdir().unwrap();
        let source = td.path().join("book");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"a").unwrap();

        let config = base_config(td.path());
        let request = RunRequest {
            source: &source,
            mode: None,
            asin_override: None,
            config: &config,
            dry_run: true,
            no_lock: true,
            force: false,
        };

        assert_eq!(run(&request).unwrap(), RunOutcome::Completed);
        assert_eq!(run(&request).unwrap(), RunOutcome::AlreadyComplete);
    }

    #[test]
    fn force_reprocesses_a_completed_book() {
        let td = tempdir().unwrap();
        let source = td.path().join("book");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"a").unwrap();

        let config = base_config(td.path());
        let mut request = RunRequest {
            source: &source,
            mode: None,
            asin_override: None,
            config: &config,
            dry_run: true,
            no_lock: true,
            force: false,
        };

        assert_eq!(run(&request).unwrap(), RunOutcome::Completed);

        request.force = true;
        assert_eq!(run(&request).unwrap(), RunOutcome::Completed);
    }

    #[test]
    fn empty_source_directory_quarantines_immediately() {
        let td = tempdir().unwrap();
        let source = td.path().join("empty");
        std::fs::create_dir_all(&source).unwrap();

        let config = base_config(td.path());
        let request = RunRequest {
            source: &source,
            mode: None,
            asin_override: None,
            config: &config,
            dry_run: true,
            no_lock: true,
            force: false,
        };

        assert_eq!(run(&request).unwrap(), RunOutcome::Quarantined);

        let store = ManifestStore::new(&config.paths.manifest_dir);
        let hash = crate::hash::book_hash(&source).unwrap();
        let manifest = store.read(&hash).unwrap().unwrap();
        assert_eq!(manifest.stage_status(StageName::Validate), chapterize_types::StageStatus::Failed);
    }

    #[test]
    fn held_lock_reports_contention_without_touching_manifest() {
        let td = tempdir().unwrap();
        let source = td.path().join("book");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"a").unwrap();

        let config = base_config(td.path());
        let _held = crate::lock::try_acquire_global(&config.paths.lock_dir).unwrap().unwrap();

        let request = RunRequest {
            source: &source,
            mode: None,
            asin_override: None,
            config: &config,
            dry_run: true,
            no_lock: false,
            force: false,
        };
        assert_eq!(run(&request).unwrap(), RunOutcome::LockContended);
    }
}
