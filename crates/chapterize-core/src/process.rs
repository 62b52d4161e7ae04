//! Dry-run-aware external-tool invocation with stderr capture.
//!
//! Every stage that shells out to the probe/encoder/tagger collaborators
//! goes through [`run_command`], so `--dry-run` has
//! exactly one choke point to short-circuit at rather than being threaded
//! through each call site by hand.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `program args...` in `working_dir`, optionally bounded by `timeout`.
/// On timeout the child is killed and its captured output (plus a note
/// appended to stderr) is returned rather than an error, so callers can
/// categorize a timeout the same way they categorize any other failure.
pub fn run_command(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn command: {program}"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child.try_wait().context("failed to poll command")? {
                Some(status) => {
                    let (out, err) = drain_output(&mut child);
                    break (status.code().unwrap_or(-1), out, err, false);
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (out, mut err) = drain_output(&mut child);
                        err.push_str(&format!(
                            "\ncommand timed out after {}",
                            humantime::format_duration(timeout_dur)
                        ));
                        break (-1, out, err, true);
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute command: {program}"))?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain_output(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// A command runner that no-ops (and logs) when dry-run is active, and
/// otherwise delegates straight to [`run_command`]. The single abstraction
/// asks for so every mutating external call is
/// dry-run-aware without each stage re-checking a flag.
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    pub dry_run: bool,
}

impl Runner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Run a command for real, or fabricate a successful no-op result when
    /// dry-run is active. `fake_stdout` lets the caller describe what the
    /// command would have produced, for stages that parse stdout (probe)
    /// and would otherwise have nothing to parse in dry-run mode.
    pub fn run(
        &self,
        program: &str,
        args: &[&str],
        working_dir: &Path,
        timeout: Option<Duration>,
        fake_stdout: &str,
    ) -> Result<CommandOutput> {
        if self.dry_run {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: fake_stdout.to_string(),
                stderr: String::new(),
                timed_out: false,
                duration: Duration::ZERO,
            });
        }
        run_command(program, args, working_dir, timeout)
    }
}
