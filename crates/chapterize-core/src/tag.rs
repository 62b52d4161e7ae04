//! Wraps the external metadata-tagging tool. Runs against the work-directory
//! copy only — tagging over NFS is forbidden because in-place atom writes
//! can tear on network filesystems.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chapterize_types::NormalizedBook;

use crate::process::Runner;

const TAG_TIMEOUT: Duration = Duration::from_secs(300);

pub fn tagger_program() -> String {
    std::env::var("CHAPTERIZE_TAGGER_BIN").unwrap_or_else(|_| "m4b-tool".to_string())
}

pub struct TagRequest<'a> {
    pub target: &'a Path,
    pub book: Option<&'a NormalizedBook>,
    pub chapter_file: Option<&'a Path>,
    pub cover_path: Option<&'a Path>,
}

/// Assemble and run the single-pass tagger invocation: one flag per
/// available metadata field, plus `--chapters` and `--cover` when present.
pub fn run_tag(runner: &Runner, work_dir: &Path, request: &TagRequest<'_>) -> Result<()> {
    let target_arg = request.target.to_string_lossy().into_owned();
    let mut args: Vec<String> = vec!["tag".to_string(), target_arg];

    if let Some(book) = request.book {
        args.push("--title".to_string());
        args.push(book.title.clone());
        if let Some(author) = book.authors.first() {
            args.push("--artist".to_string());
            args.push(author.name.clone());
        }
        if let Some(series) = &book.series_primary {
            args.push("--series".to_string());
            args.push(series.name.clone());
            args.push("--series-part".to_string());
            args.push(format!("{}", series.position));
        }
        if let Some(description) = book.description.as_ref().or(book.summary.as_ref()) {
            args.push("--description".to_string());
            args.push(description.clone());
        }
        if let Some(release_date) = &book.release_date {
            let normalized = chapterize_types::normalize_release_date(release_date);
            if normalized.len() >= 4 {
                args.push("--year".to_string());
                args.push(normalized[..4].to_string());
            }
        }
    }

    if let Some(chapter_file) = request.chapter_file {
        args.push("--chapters".to_string());
        args.push(chapter_file.to_string_lossy().into_owned());
    }
    if let Some(cover_path) = request.cover_path {
        args.push("--cover".to_string());
        args.push(cover_path.to_string_lossy().into_owned());
    }

    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner.run(&tagger_program(), &args_ref, work_dir, Some(TAG_TIMEOUT), "")?;
    if !output.success() {
        anyhow::bail!(
            "tagger failed (exit {}): {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(())
}
