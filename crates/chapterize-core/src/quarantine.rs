//! Quarantine : on permanent failure or retry exhaustion,
//! move the offending source into `<failed_dir>/<book_name>[.N]/` alongside
//! an `ERROR.txt` summary and a copy of the manifest, so the external
//! automation cycle stops retrying a book that cannot succeed on its own.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chapterize_state::Manifest;
use chapterize_types::ErrorContext;

/// Move `source` into a fresh slot under `failed_dir`, write `ERROR.txt` and
/// a manifest snapshot into it, and return the slot's path. Collisions with
/// an existing quarantine directory of the same book name are resolved by
/// appending `.1`, `.2`, ... rather than overwriting a previous failure.
pub fn quarantine(
    failed_dir: &Path,
    source: &Path,
    manifest: &Manifest,
    error: &ErrorContext,
) -> Result<PathBuf> {
    std::fs::create_dir_all(failed_dir)
        .with_context(|| format!("failed to create quarantine directory {}", failed_dir.display()))?;

    let book_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown-book");
    let dest = next_available_slot(failed_dir, book_name);
    std::fs::create_dir_all(&dest)
        .with_context(|| format!("failed to create quarantine slot {}", dest.display()))?;

    move_source_into(source, &dest)?;
    write_error_summary(&dest, error)?;
    write_manifest_copy(&dest, manifest)?;

    Ok(dest)
}

/// `<failed_dir>/<book_name>`, or `.1`, `.2`, ... if that name is already
/// occupied by an earlier quarantined attempt.
fn next_available_slot(failed_dir: &Path, book_name: &str) -> PathBuf {
    let base = failed_dir.join(book_name);
    if !base.exists() {
        return base;
    }
    for n in 1u32.. {
        let candidate = failed_dir.join(format!("{book_name}.{n}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 space exhausted looking for a free quarantine slot")
}

/// Move the source material itself into the quarantine slot: a directory's
/// contents land directly inside `dest` (which `quarantine` has already
/// created), a single file lands inside it under its own name.
fn move_source_into(source: &Path, dest: &Path) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }
    if source.is_file() {
        let target = dest.join(source.file_name().unwrap_or_default());
        return rename_or_copy(source, &target);
    }
    crate::archive_check::move_originals(source, dest)
}

fn rename_or_copy(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from).with_context(|| format!("failed to remove original {}", from.display()))?;
    Ok(())
}

/// `ERROR.txt`: a human-readable summary an operator can read without
/// touching the manifest JSON ("user-visible behavior").
fn write_error_summary(dest: &Path, error: &ErrorContext) -> Result<()> {
    let body = format!(
        "stage={}\ntimestamp={}\nexit_code={}\ncategory={:?}\nmessage={}\n",
        error.stage,
        error.timestamp.to_rfc3339(),
        error
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
        error.category,
        error.message,
    );
    std::fs::write(dest.join("ERROR.txt"), body)
        .with_context(|| format!("failed to write ERROR.txt in {}", dest.display()))
}

fn write_manifest_copy(dest: &Path, manifest: &Manifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest).context("failed to serialize manifest for quarantine copy")?;
    std::fs::write(dest.join("manifest.json"), json)
        .with_context(|| format!("failed to write manifest.json in {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapterize_state::ManifestStore;
    use chapterize_types::{ErrorCategory, Mode, StageName};
    use tempfile::tempdir;

    fn sample_error() -> ErrorContext {
        ErrorContext {
            stage: StageName::Validate,
            timestamp: chrono::Utc::now(),
            exit_code: Some(2),
            message: "no audio files found".to_string(),
            category: ErrorCategory::Permanent,
        }
    }

    #[test]
    fn quarantine_moves_directory_and_writes_summary() {
        let td = tempdir().unwrap();
        let source = td.path().join("BookDir");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"a").unwrap();

        let failed_dir = td.path().join("failed");
        let store = ManifestStore::new(&td.path().join("manifests"));
        let manifest = store.create("hash1", &source, Mode::Convert).unwrap();

        let dest = quarantine(&failed_dir, &source, &manifest, &sample_error()).unwrap();

        assert_eq!(dest, failed_dir.join("BookDir"));
        assert!(dest.join("ch1.mp3").exists());
        assert!(dest.join("ERROR.txt").exists());
        assert!(dest.join("manifest.json").exists());
        assert!(!source.exists());

        let error_text = std::fs::read_to_string(dest.join("ERROR.txt")).unwrap();
        assert!(error_text.contains("stage=validate"));
        assert!(error_text.contains("category=Permanent"));
    }

    #[test]
    fn repeated_quarantine_of_same_book_name_suffixes_the_slot() {
        let td = tempdir().unwrap();
        let failed_dir = td.path().join("failed");
        let store = ManifestStore::new(&td.path().join("manifests"));

        let first_source = td.path().join("attempt1").join("BookDir");
        std::fs::create_dir_all(&first_source).unwrap();
        let first_manifest = store.create("hash1", &first_source, Mode::Convert).unwrap();
        let first_dest = quarantine(&failed_dir, &first_source, &first_manifest, &sample_error()).unwrap();

        let second_source = td.path().join("attempt2").join("BookDir");
        std::fs::create_dir_all(&second_source).unwrap();
        let second_manifest = store.create("hash2", &second_source, Mode::Convert).unwrap();
        let second_dest = quarantine(&failed_dir, &second_source, &second_manifest, &sample_error()).unwrap();

        assert_eq!(first_dest, failed_dir.join("BookDir"));
        assert_eq!(second_dest, failed_dir.join("BookDir.1"));
    }

    #[test]
    fn quarantine_is_a_noop_when_source_already_gone() {
        let td = tempdir().unwrap();
        let source = td.path().join("already-gone");
        let failed_dir = td.path().join("failed");
        let store = ManifestStore::new(&td.path().join("manifests"));
        let manifest = store.create("hash1", &source, Mode::Convert).unwrap();

        let dest = quarantine(&failed_dir, &source, &manifest, &sample_error()).unwrap();
        assert!(dest.join("ERROR.txt").exists());
    }
}
