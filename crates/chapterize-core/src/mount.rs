//! Library mount health check : organize must not start
//! copying into the NFS-backed library root until the mount has proven it
//! responds, since a stale/hung mount blocks on the first stat for minutes
//! rather than failing fast.
//!
//! The probe runs `fs::metadata` on a background thread and waits on it with
//! a bounded timeout rather than calling it inline, because a truly hung NFS
//! mount doesn't return an I/O error — the syscall itself doesn't return.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;

use crate::errors::PipelineError;

/// Spec default: probe the library root with a 5 second timeout before any
/// write.
pub const MOUNT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe `library_root` for responsiveness. `Ok(())` means the filesystem
/// answered within `timeout`, whether or not the path exists yet — a fast
/// "not found" is a live mount, just an empty one, and organize's own
/// `create_dir_all` handles that case next. Only the absence of *any*
/// answer within the deadline is treated as a [`PipelineError::Transient`]
/// mount failure, since a stale/hung NFS mount stalls the syscall itself
/// rather than returning an error.
pub fn check_mount_health(library_root: &Path, timeout: Duration) -> Result<()> {
    let root: PathBuf = library_root.to_path_buf();
    let (tx, rx) = mpsc::channel();

    // Detached: if the stat never returns, this thread leaks rather than
    // blocking the pipeline, which is the correct trade for a hung mount.
    // A plain stat, not a write: the health check must not mutate anything
    // under `--dry-run`.
    std::thread::spawn(move || {
        let _ = tx.send(std::fs::metadata(&root));
    });

    match rx.recv_timeout(timeout) {
        Ok(_) => Ok(()),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(PipelineError::transient(format!(
            "library mount {} did not respond within {}",
            library_root.display(),
            humantime::format_duration(timeout)
        ))
        .into()),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(PipelineError::transient(format!(
            "library mount health check for {} failed unexpectedly",
            library_root.display()
        ))
        .into()),
    }
}
