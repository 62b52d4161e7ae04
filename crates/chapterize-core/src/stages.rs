//! Per-stage logic : wires the leaf utilities in this
//! crate (probing, encoding, tagging, Plex path construction, archive
//! integrity) and the metadata clients to one canonical pipeline stage each.
//! [`crate::orchestrator`] drives these in [`chapterize_types::StageName`]
//! order and persists their typed outcomes into the manifest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chapterize_config::{Config, MetadataSourcePreference};
use chapterize_metadata::{FallbackAggregatorClient, MetadataClient, PrimaryCatalogClient};
use chapterize_state::Manifest;
use chapterize_types::{AsinSource, NormalizedBook, StageName};

use crate::chapters::{self, Chapter, ChapterGateOutcome};
use crate::errors::PipelineError;
use crate::logging::Reporter;
use crate::process::Runner;

/// Similarity floor for the catalog title/author fuzzy search; candidates
/// scoring below this are treated as no match.
const ASIN_SEARCH_THRESHOLD: f64 = 0.82;

const COVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a downloaded cover image, well above any real catalog
/// cover but far below a runaway or malicious response body.
const MAX_COVER_BYTES: u64 = 10 * 1024 * 1024;

pub struct PipelineContext<'a> {
    pub config: &'a Config,
    pub runner: Runner,
    pub reporter: &'a Reporter,
    pub primary: &'a PrimaryCatalogClient,
    pub fallback: &'a FallbackAggregatorClient,
}

pub struct ValidateOutcome {
    pub file_count: usize,
    pub source_bytes: u64,
}

pub struct ConcatOutcome {
    pub concat_list: PathBuf,
    pub chapter_metadata: Option<PathBuf>,
    pub file_boundary_chapter_file: Option<PathBuf>,
    pub input_files: Vec<PathBuf>,
    pub chapter_count: usize,
}

pub struct ConvertOutcome {
    pub output_path: PathBuf,
    pub duration_s: f64,
}

pub struct AsinOutcome {
    pub discovery: Option<crate::asin::AsinDiscovery>,
}

pub struct MetadataOutcome {
    pub output_path: PathBuf,
    pub book: Option<NormalizedBook>,
    pub cover_path: Option<PathBuf>,
    pub desc_path: Option<PathBuf>,
    pub reader_path: Option<PathBuf>,
}

pub struct OrganizeOutcome {
    pub deployed_path: PathBuf,
}

pub struct ArchiveOutcome {
    pub archived_to: PathBuf,
}

/// Validate stage : every input file must probe cleanly, and
/// the work directory's filesystem must have 3x the source size free.
pub fn run_validate(
    ctx: &PipelineContext,
    book_hash: &str,
    source: &Path,
    work_dir: &Path,
) -> Result<ValidateOutcome> {
    ctx.reporter.info("validate", book_hash, &format!("validating {}", source.display()));

    let file_count = if source.is_dir() {
        let mut files = crate::hash::collect_audio_files(source)?;
        crate::hash::sort_version_aware(&mut files);
        if files.is_empty() {
            return Err(PipelineError::permanent_with_code("no audio files found in source directory", 2).into());
        }
        for file in &files {
            crate::probe::probe_file(&ctx.runner, file)
                .map_err(|e| PipelineError::permanent(format!("unreadable audio file {}: {e:#}", file.display())))?;
        }
        files.len()
    } else {
        crate::probe::probe_file(&ctx.runner, source)
            .map_err(|e| PipelineError::permanent(format!("unreadable source file {}: {e:#}", source.display())))?;
        1
    };

    let source_bytes = crate::diskspace::source_byte_size(source)?;
    match crate::diskspace::check_free_space(work_dir, source_bytes)? {
        Ok(()) => {}
        Err(shortfall) => {
            return Err(PipelineError::permanent(format!(
                "insufficient free space in work directory: short by {shortfall} bytes"
            ))
            .into());
        }
    }

    Ok(ValidateOutcome { file_count, source_bytes })
}

/// Concat stage : build the demuxer's file list and the
/// file-boundary chapter set, in both the FFMETADATA shape the encoder
/// consumes and the plain-text shape the tagger consumes.
pub fn run_concat(ctx: &PipelineContext, source: &Path, work_dir: &Path) -> Result<ConcatOutcome> {
    let mut input_files = if source.is_dir() {
        crate::hash::collect_audio_files(source)?
    } else {
        vec![source.to_path_buf()]
    };
    crate::hash::sort_version_aware(&mut input_files);

    let mut durations = Vec::with_capacity(input_files.len());
    for file in &input_files {
        let report = crate::probe::probe_file(&ctx.runner, file)
            .map_err(|e| PipelineError::transient(format!("probe failed for {}: {e:#}", file.display())))?;
        durations.push((file.as_path(), report.duration_s));
    }
    let chapters = chapters::synthesize_from_durations(&durations);

    let concat_list = crate::encode::write_concat_list(work_dir, &input_files)?;
    let chapter_metadata = crate::encode::write_chapter_metadata(work_dir, &chapters)?;

    let file_boundary_chapter_file = if chapters.is_empty() {
        None
    } else {
        let path = work_dir.join("file_boundary_chapters.txt");
        std::fs::write(&path, chapters::format_chapter_file(&chapters))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Some(path)
    };

    Ok(ConcatOutcome {
        concat_list,
        chapter_metadata,
        file_boundary_chapter_file,
        chapter_count: chapters.len(),
        input_files,
    })
}

/// Convert stage : run the single-pass encode and immediately
/// re-probe the output, since a bad encode must never be mistaken for a
/// good one just because `ffmpeg` exited zero.
pub fn run_convert(ctx: &PipelineContext, manifest: &Manifest, work_dir: &Path) -> Result<ConvertOutcome> {
    let concat_record = manifest
        .stages
        .get(&StageName::Concat)
        .context("concat stage record missing")?;
    let concat_list = concat_record
        .output_path
        .clone()
        .context("concat stage has no output path")?;
    let chapter_metadata = extra_path(&concat_record.extra, "chapter_metadata");
    let input_files = extra_path_list(&concat_record.extra, "input_files");

    let source_kbps = match input_files.first() {
        Some(file) => crate::probe::probe_file(&ctx.runner, file)
            .ok()
            .and_then(|r| r.bit_rate_kbps)
            .unwrap_or(ctx.config.audio.max_bitrate_kbps),
        None => ctx.config.audio.max_bitrate_kbps,
    };
    let bitrate_kbps = crate::encode::select_bitrate_kbps(source_kbps, ctx.config.audio.max_bitrate_kbps);

    let output_path = work_dir.join("converted.m4b");
    let request = crate::encode::EncodeRequest {
        concat_list: &concat_list,
        chapter_metadata: chapter_metadata.as_deref(),
        output_path: &output_path,
        bitrate_kbps,
        channels: ctx.config.audio.channels,
    };
    crate::encode::run_encode(&ctx.runner, work_dir, &request)
        .map_err(|e| PipelineError::transient(format!("encode failed: {e:#}")))?;

    let integrity = crate::archive_check::check_integrity(&ctx.runner, &output_path)?;
    let report = integrity.map_err(|fail| PipelineError::transient(format!("post-encode check failed: {fail}")))?;

    Ok(ConvertOutcome { output_path, duration_s: report.duration_s })
}

/// ASIN stage : discovery failure is a graceful skip, not an
/// error — downstream stages proceed without catalog metadata.
pub fn run_asin(ctx: &PipelineContext, manifest: &Manifest, cli_override: Option<&str>) -> Result<AsinOutcome> {
    let discovery = crate::asin::discover_asin(
        &manifest.source_path,
        cli_override,
        ctx.fallback,
        ASIN_SEARCH_THRESHOLD,
    )?;

    if discovery.is_none() {
        ctx.reporter.warn(
            "asin",
            &manifest.book_hash,
            "no ASIN discovered; proceeding without catalog metadata",
        );
    } else if matches!(discovery.as_ref().map(|d| d.source), Some(AsinSource::UnvalidatedFallback)) {
        ctx.reporter.warn(
            "asin",
            &manifest.book_hash,
            "accepted a format-valid ASIN without aggregator confirmation (aggregator was unreachable)",
        );
    }

    Ok(AsinOutcome { discovery })
}

/// Metadata stage : fetch and normalize catalog data (when an
/// ASIN is on record), apply the chapter duration gate, download a cover,
/// and tag the work-directory copy in a single pass.
pub fn run_metadata(ctx: &PipelineContext, manifest: &Manifest, work_dir: &Path) -> Result<MetadataOutcome> {
    let work_copy = resolve_work_copy(manifest, work_dir)?;

    let book = match &manifest.metadata.asin {
        None => {
            ctx.reporter.warn("metadata", &manifest.book_hash, "no ASIN on record; skipping catalog enrichment");
            None
        }
        Some(asin) => match fetch_book(ctx, asin) {
            Ok(book) => book,
            Err(e) => {
                ctx.reporter.warn(
                    "metadata",
                    &manifest.book_hash,
                    &format!("catalog lookup failed, proceeding without it: {e:#}"),
                );
                None
            }
        },
    };

    let chapter_file = resolve_chapter_file(ctx, manifest, &work_copy, book.as_ref())?;
    let cover_path = book
        .as_ref()
        .and_then(|b| b.image.as_deref())
        .and_then(|url| download_cover(ctx, url, work_dir).ok().flatten());

    let request = crate::tag::TagRequest {
        target: &work_copy,
        book: book.as_ref(),
        chapter_file: chapter_file.as_deref(),
        cover_path: cover_path.as_deref(),
    };
    crate::tag::run_tag(&ctx.runner, work_dir, &request)
        .map_err(|e| PipelineError::transient(format!("tagging failed: {e:#}")))?;

    let (desc_path, reader_path) = write_companion_files(work_dir, book.as_ref())?;

    Ok(MetadataOutcome { output_path: work_copy, book, cover_path, desc_path, reader_path })
}

/// Emit the two plain-text companions the organize stage deploys alongside
/// the cover: `desc.txt` (HTML stripped) and `reader.txt` (narrator names,
/// one consolidated line). Either is omitted when the catalog offered
/// nothing to write — an empty file would be worse than no file.
fn write_companion_files(work_dir: &Path, book: Option<&NormalizedBook>) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
    let Some(book) = book else {
        return Ok((None, None));
    };

    let desc_path = match book.description.as_ref().or(book.summary.as_ref()) {
        Some(raw) => {
            let path = work_dir.join("desc.txt");
            std::fs::write(&path, strip_html(raw)).with_context(|| format!("failed to write {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    let reader_path = if book.narrators.is_empty() {
        None
    } else {
        let names = book.narrators.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ");
        let path = work_dir.join("reader.txt");
        std::fs::write(&path, names).with_context(|| format!("failed to write {}", path.display()))?;
        Some(path)
    };

    Ok((desc_path, reader_path))
}

/// Drop `<tag>` markup and decode the handful of entities catalog
/// descriptions actually use, leaving plain text for `desc.txt`.
fn strip_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .trim()
        .to_string()
}

fn fetch_book(ctx: &PipelineContext, asin: &str) -> Result<Option<NormalizedBook>> {
    let (first, second): (&dyn MetadataClient, &dyn MetadataClient) = match ctx.config.metadata.source {
        MetadataSourcePreference::Primary => (ctx.primary, ctx.fallback),
        MetadataSourcePreference::Fallback => (ctx.fallback, ctx.primary),
    };
    match first.fetch_book(asin, false) {
        Ok(Some(book)) => Ok(Some(book)),
        Ok(None) => second.fetch_book(asin, false),
        Err(_) => second.fetch_book(asin, false),
    }
}

fn resolve_chapter_file(
    ctx: &PipelineContext,
    manifest: &Manifest,
    work_copy: &Path,
    book: Option<&NormalizedBook>,
) -> Result<Option<PathBuf>> {
    let file_boundary_chapter_file = manifest
        .stages
        .get(&StageName::Concat)
        .and_then(|record| extra_path(&record.extra, "file_boundary_chapter_file"));

    let Some(book) = book else {
        return Ok(file_boundary_chapter_file);
    };

    let probed = crate::probe::probe_file(&ctx.runner, work_copy)?;
    let probed_ms = (probed.duration_s * 1000.0).round() as u64;

    match chapters::apply_duration_gate(book.chapters.as_ref(), probed_ms, ctx.config.metadata.chapter_duration_tolerance_pct) {
        ChapterGateOutcome::UseCatalog(catalog_chapters) => {
            let path = work_copy
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("catalog_chapters.txt");
            write_tagger_chapter_file(&path, &catalog_chapters)?;
            Ok(Some(path))
        }
        ChapterGateOutcome::KeepFileBoundary => Ok(file_boundary_chapter_file),
    }
}

fn write_tagger_chapter_file(path: &Path, chapters: &[Chapter]) -> Result<()> {
    std::fs::write(path, chapters::format_chapter_file(chapters))
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Download the catalog's cover image, rejecting anything over
/// [`MAX_COVER_BYTES`] or that doesn't start with a JPEG/PNG signature.
/// Never runs under `--dry-run` (no network side effects are needed to
/// exercise the rest of the stage).
fn download_cover(ctx: &PipelineContext, url: &str, work_dir: &Path) -> Result<Option<PathBuf>> {
    if ctx.runner.dry_run {
        return Ok(None);
    }
    let client = reqwest::blocking::Client::builder()
        .timeout(COVER_REQUEST_TIMEOUT)
        .build()
        .context("failed to build cover-download HTTP client")?;
    let response = client.get(url).send().context("cover download request failed")?;
    if !response.status().is_success() {
        return Ok(None);
    }
    if response.content_length().is_some_and(|len| len > MAX_COVER_BYTES) {
        return Ok(None);
    }
    let bytes = response.bytes().context("failed to read cover response body")?;
    if bytes.len() as u64 > MAX_COVER_BYTES || !looks_like_image(&bytes) {
        return Ok(None);
    }
    let path = work_dir.join("cover.jpg");
    std::fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF]) || bytes.starts_with(b"\x89PNG\r\n\x1a\n")
}

/// For enrich-mode runs the convert stage never ran, so the "work copy" is
/// the original M4B copied once into the work directory; for convert-mode
/// runs it's simply the encoder's output.
fn resolve_work_copy(manifest: &Manifest, work_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = manifest.stages.get(&StageName::Convert).and_then(|r| r.output_path.clone()) {
        return Ok(path);
    }
    let dest = work_dir.join("converted.m4b");
    if !dest.exists() {
        std::fs::copy(&manifest.source_path, &dest)
            .with_context(|| format!("failed to copy {} into work directory", manifest.source_path.display()))?;
    }
    Ok(dest)
}

/// Organize stage : deploy the tagged work copy to its Plex
/// library path and apply configured ownership/permissions.
pub fn run_organize(ctx: &PipelineContext, manifest: &Manifest) -> Result<OrganizeOutcome> {
    crate::mount::check_mount_health(&ctx.config.paths.nfs_output_dir, crate::mount::MOUNT_HEALTH_TIMEOUT)?;

    let metadata_record = manifest.stages.get(&StageName::Metadata).context("metadata stage has no output path")?;
    let tagged_path = metadata_record.output_path.clone().context("metadata stage has no output path")?;
    let cover_path = extra_path(&metadata_record.extra, "cover_path");
    let desc_path = extra_path(&metadata_record.extra, "desc_path");
    let reader_path = extra_path(&metadata_record.extra, "reader_path");

    let source_name = manifest
        .source_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown");
    let embedded = resolve_embedded_tags(ctx, &manifest.book_hash, &tagged_path);
    let inputs = crate::plex_path::PlexPathInputs {
        book: manifest.metadata.normalized.as_ref(),
        embedded: embedded.as_ref(),
        source_name,
        book_hash: &manifest.book_hash,
        library_base: &ctx.config.paths.nfs_output_dir,
    };
    let dest = crate::plex_path::build_plex_path(&inputs);

    if ctx.runner.dry_run {
        return Ok(OrganizeOutcome { deployed_path: dest });
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        apply_dir_permissions(parent, ctx.config)?;
    }

    if !already_deployed(&tagged_path, &dest)? {
        copy_verify(&tagged_path, &dest)?;
    }
    apply_file_permissions(&dest, ctx.config)?;

    let companion_dir = dest.parent().unwrap_or_else(|| Path::new("."));
    deploy_companion(cover_path.as_deref(), &companion_dir.join("cover.jpg"), ctx.config)?;
    deploy_companion(desc_path.as_deref(), &companion_dir.join("desc.txt"), ctx.config)?;
    deploy_companion(reader_path.as_deref(), &companion_dir.join("reader.txt"), ctx.config)?;

    Ok(OrganizeOutcome { deployed_path: dest })
}

/// Read the container's `artist`/`title` tags off the work-directory copy,
/// for the organize stage's embedded-tag fallback (spec.md §4.8, second
/// priority after catalog metadata). A probe failure here is never fatal —
/// it just leaves the fallback empty and resolution falls through to the
/// folder-name heuristic.
fn resolve_embedded_tags(ctx: &PipelineContext, book_hash: &str, path: &Path) -> Option<crate::plex_path::EmbeddedTags> {
    match crate::probe::probe_file(&ctx.runner, path) {
        Ok(report) => Some(crate::plex_path::EmbeddedTags {
            artist: report.artist,
            title: report.title,
        }),
        Err(e) => {
            ctx.reporter.warn(
                "organize",
                book_hash,
                &format!("failed to read embedded tags from {}: {e:#}", path.display()),
            );
            None
        }
    }
}

/// The destination already holds this exact book when it exists and its
/// size matches the work-directory copy — re-running organize after the
/// library copy already landed should skip the (potentially slow, NFS-bound)
/// copy rather than redo it.
fn already_deployed(tagged_path: &Path, dest: &Path) -> Result<bool> {
    if !dest.exists() {
        return Ok(false);
    }
    let source_len = std::fs::metadata(tagged_path).with_context(|| format!("failed to stat {}", tagged_path.display()))?.len();
    let dest_len = std::fs::metadata(dest)?.len();
    Ok(source_len == dest_len)
}

/// Copy one optional companion file into place if the stage produced it.
/// Like the main M4B, this always runs even when the destination file
/// already exists, so permissions stay current.
fn deploy_companion(source: Option<&Path>, dest: &Path, config: &Config) -> Result<()> {
    let Some(source) = source else {
        return Ok(());
    };
    std::fs::copy(source, dest).with_context(|| format!("failed to copy {} to {}", source.display(), dest.display()))?;
    apply_file_permissions(dest, config)?;
    Ok(())
}

fn copy_verify(from: &Path, to: &Path) -> Result<()> {
    let expected = std::fs::metadata(from).with_context(|| format!("failed to stat {}", from.display()))?.len();
    std::fs::copy(from, to).with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    let actual = std::fs::metadata(to)?.len();
    if actual != expected {
        anyhow::bail!(
            "copy verification failed for {}: expected {expected} bytes, got {actual}",
            from.display()
        );
    }
    Ok(())
}

fn apply_file_permissions(path: &Path, config: &Config) -> Result<()> {
    if let Some(mode) = config.permissions.file_mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    if let Some(owner) = &config.permissions.file_owner {
        apply_owner(path, owner)?;
    }
    Ok(())
}

fn apply_dir_permissions(path: &Path, config: &Config) -> Result<()> {
    if let Some(mode) = config.permissions.dir_mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    Ok(())
}

/// Apply `uid:gid` ownership. Only numeric ids are supported: resolving
/// `user:group` names would require linking against the host's NSS/passwd
/// database, which this pipeline doesn't do (see DESIGN.md).
fn apply_owner(path: &Path, owner: &str) -> Result<()> {
    let (uid_str, gid_str) = owner
        .split_once(':')
        .with_context(|| format!("file_owner must be in uid:gid form, got {owner:?}"))?;
    let uid: u32 = uid_str.parse().with_context(|| format!("invalid uid in {owner:?}"))?;
    let gid: u32 = gid_str.parse().with_context(|| format!("invalid gid in {owner:?}"))?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to chown {}", path.display()))?;
    Ok(())
}

/// Archive stage : the 6-point integrity gate on the deployed
/// file, then the destructive move of the original source material.
pub fn run_archive(ctx: &PipelineContext, manifest: &Manifest) -> Result<ArchiveOutcome> {
    let deployed = manifest
        .stages
        .get(&StageName::Organize)
        .and_then(|r| r.output_path.clone())
        .context("organize stage has no output path")?;

    let integrity = crate::archive_check::check_integrity(&ctx.runner, &deployed)?;
    integrity.map_err(|fail| PipelineError::transient(format!("archive integrity gate failed: {fail}")))?;

    if !ctx.runner.dry_run {
        crate::archive_check::move_originals(&manifest.source_path, &ctx.config.paths.archive_dir)?;
    }

    Ok(ArchiveOutcome { archived_to: ctx.config.paths.archive_dir.clone() })
}

/// Cleanup stage : remove the work directory, when enabled.
pub fn run_cleanup(ctx: &PipelineContext, work_dir: &Path) -> Result<()> {
    if ctx.config.behavior.cleanup_work_dir && !ctx.runner.dry_run {
        let _ = std::fs::remove_dir_all(work_dir);
    }
    Ok(())
}

fn extra_path(extra: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<PathBuf> {
    extra.get(key).and_then(|v| v.as_str()).map(PathBuf::from)
}

fn extra_path_list(extra: &serde_json::Map<String, serde_json::Value>, key: &str) -> Vec<PathBuf> {
    extra
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).map(PathBuf::from).collect())
        .unwrap_or_default()
}
