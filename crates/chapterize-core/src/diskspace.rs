//! Disk-space pre-flight : the work directory's filesystem
//! must have at least 3x the source's byte size free before validate
//! proceeds, covering the source, the intermediate concat/mux output, the
//! final M4B, and headroom.

use std::path::Path;

use anyhow::{Context, Result};

/// Multiplier applied to the source byte size to get the required free
/// space on the work directory's filesystem.
pub const REQUIRED_FREE_SPACE_MULTIPLIER: u64 = 3;

/// Total bytes of a source path: file size for a single file, recursive sum
/// for a directory.
pub fn source_byte_size(source: &Path) -> std::io::Result<u64> {
    if source.is_dir() {
        let mut total = 0u64;
        sum_dir(source, &mut total)?;
        Ok(total)
    } else {
        Ok(std::fs::metadata(source)?.len())
    }
}

fn sum_dir(dir: &Path, total: &mut u64) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            sum_dir(&path, total)?;
        } else if file_type.is_file() {
            *total += entry.metadata()?.len();
        }
    }
    Ok(())
}

/// Check that `work_dir`'s filesystem has at least `3 * source_bytes` free.
/// Returns `Ok()` when there's enough room, `Ok(Err(shortfall_bytes))`
/// when there isn't — callers turn a shortfall into a permanent failure
/// rather than this function erroring itself, since "not
/// enough space" is an expected outcome, not a plumbing failure.
pub fn check_free_space(work_dir: &Path, source_bytes: u64) -> Result<Result<(), u64>> {
    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("failed to create work directory {}", work_dir.display()))?;

    let available = fs2::available_space(work_dir)
        .with_context(|| format!("failed to stat free space for {}", work_dir.display()))?;
    let required = source_bytes.saturating_mul(REQUIRED_FREE_SPACE_MULTIPLIER);

    if available >= required {
        Ok(Ok(()))
    } else {
        Ok(Err(required - available))
    }
}
