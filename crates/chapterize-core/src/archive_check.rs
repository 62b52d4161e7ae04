//! Archive stage support : the 6-point M4B integrity check
//! that gates any destructive move of originals, plus the same-filesystem
//! rename vs. cross-filesystem copy-verify-unlink move itself.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{Context, Result};

use crate::probe::{ProbeReport, probe_file};
use crate::process::Runner;

/// Tolerance for the size-vs-bitrate sanity check (point 6).
const SIZE_TOLERANCE_PCT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityFailure {
    Empty,
    ProbeFailed(String),
    ZeroDuration,
    NotAac { codec: Option<String> },
    UnexpectedContainer { format: Option<String> },
    SizeMismatch { expected_bytes: u64, actual_bytes: u64 },
}

impl std::fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFailure::Empty => write!(f, "output file is missing or empty"),
            IntegrityFailure::ProbeFailed(msg) => write!(f, "probe could not parse output container: {msg}"),
            IntegrityFailure::ZeroDuration => write!(f, "output duration is zero"),
            IntegrityFailure::NotAac { codec } => {
                write!(f, "output audio codec is not AAC (got {codec:?})")
            }
            IntegrityFailure::UnexpectedContainer { format } => {
                write!(f, "output container format is not mp4/mov (got {format:?})")
            }
            IntegrityFailure::SizeMismatch { expected_bytes, actual_bytes } => write!(
                f,
                "output size {actual_bytes} bytes is outside {SIZE_TOLERANCE_PCT}% of the expected {expected_bytes} bytes"
            ),
        }
    }
}

/// Run all 6 points in order, short-circuiting on the first failure. Every
/// failure here is transient : the caller retries rather than
/// destroying the originals.
pub fn check_integrity(runner: &Runner, output: &Path) -> Result<Result<ProbeReport, IntegrityFailure>> {
    let metadata = match std::fs::metadata(output) {
        Ok(m) => m,
        Err(_) => return Ok(Err(IntegrityFailure::Empty)),
    };
    if metadata.len() == 0 {
        return Ok(Err(IntegrityFailure::Empty));
    }

    let report = match probe_file(runner, output) {
        Ok(r) => r,
        Err(e) => return Ok(Err(IntegrityFailure::ProbeFailed(format!("{e:#}")))),
    };

    if report.duration_s <= 0.0 {
        return Ok(Err(IntegrityFailure::ZeroDuration));
    }
    if !report.is_aac() {
        return Ok(Err(IntegrityFailure::NotAac { codec: report.codec_name.clone() }));
    }
    if !report.format_looks_like_mp4() {
        return Ok(Err(IntegrityFailure::UnexpectedContainer { format: report.format_name.clone() }));
    }

    if let Some(bitrate_kbps) = report.bit_rate_kbps {
        let expected_bytes = ((bitrate_kbps as f64 * 1000.0 / 8.0) * report.duration_s) as u64;
        let actual_bytes = metadata.len();
        let diff = expected_bytes.abs_diff(actual_bytes);
        let pct = if expected_bytes == 0 { 0.0 } else { (diff as f64 / expected_bytes as f64) * 100.0 };
        if pct > SIZE_TOLERANCE_PCT {
            return Ok(Err(IntegrityFailure::SizeMismatch { expected_bytes, actual_bytes }));
        }
    }

    Ok(Ok(report))
}

/// Move every file under `source` into `archive_base`, preserving relative
/// structure, via `rename` when both are on the same filesystem or
/// copy-verify-unlink when they aren't. Idempotent: an already-empty or
/// missing source is treated as already archived.
pub fn move_originals(source: &Path, archive_base: &Path) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }

    if source.is_file() {
        return move_one(source, &archive_base.join(source.file_name().unwrap_or_default()));
    }

    for entry in std::fs::read_dir(source).with_context(|| format!("failed to read {}", source.display()))? {
        let entry = entry?;
        let dest = archive_base.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            move_originals(&entry.path(), &dest)?;
            let _ = std::fs::remove_dir(entry.path());
        } else {
            move_one(&entry.path(), &dest)?;
        }
    }

    let is_empty = std::fs::read_dir(source).map(|mut d| d.next().is_none()).unwrap_or(false);
    if is_empty {
        let _ = std::fs::remove_dir(source);
    }
    Ok(())
}

fn move_one(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if same_filesystem(from, to.parent().unwrap_or(to))? {
        std::fs::rename(from, to).with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))?;
        return Ok(());
    }

    let expected_len = std::fs::metadata(from)?.len();
    std::fs::copy(from, to).with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    let copied_len = std::fs::metadata(to)?.len();
    if copied_len != expected_len {
        anyhow::bail!(
            "copy verification failed for {}: expected {expected_len} bytes, got {copied_len}",
            from.display()
        );
    }
    std::fs::remove_file(from).with_context(|| format!("failed to remove original {}", from.display()))?;
    Ok(())
}

fn same_filesystem(a: &Path, b: &Path) -> Result<bool> {
    let a_dev = std::fs::metadata(a).with_context(|| format!("failed to stat {}", a.display()))?.dev();
    let b_dir = if b.exists() { b.to_path_buf() } else { b.parent().unwrap_or(b).to_path_buf() };
    let b_dev = std::fs::metadata(&b_dir).with_context(|| format!("failed to stat {}", b_dir.display()))?.dev();
    Ok(a_dev == b_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_output_fails_first_check() {
        let td = tempdir().unwrap();
        let path = td.path().join("out.m4b");
        std::fs::write(&path, []).unwrap();
        let runner = Runner::new(false);
        let result = check_integrity(&runner, &path).unwrap();
        assert_eq!(result.unwrap_err(), IntegrityFailure::Empty);
    }

    #[test]
    fn missing_output_fails_first_check() {
        let td = tempdir().unwrap();
        let runner = Runner::new(false);
        let result = check_integrity(&runner, &td.path().join("missing.m4b")).unwrap();
        assert_eq!(result.unwrap_err(), IntegrityFailure::Empty);
    }

    #[test]
    fn move_originals_renames_within_same_filesystem() {
        let td = tempdir().unwrap();
        let source = td.path().join("source");
        let archive = td.path().join("archive");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("ch1.mp3"), b"abc").unwrap();

        move_originals(&source, &archive).unwrap();

        assert!(archive.join("ch1.mp3").exists());
        assert!(!source.join("ch1.mp3").exists());
    }

    #[test]
    fn move_originals_is_idempotent_on_missing_source() {
        let td = tempdir().unwrap();
        let source = td.path().join("already-gone");
        let archive = td.path().join("archive");
        assert!(move_originals(&source, &archive).is_ok());
    }

    #[test]
    fn move_originals_handles_nested_directories() {
        let td = tempdir().unwrap();
        let source = td.path().join("source");
        let archive = td.path().join("archive");
        std::fs::create_dir_all(source.join("disc1")).unwrap();
        std::fs::write(source.join("disc1/ch1.mp3"), b"abc").unwrap();

        move_originals(&source, &archive).unwrap();

        assert!(archive.join("disc1/ch1.mp3").exists());
        assert!(!source.exists());
    }
}
