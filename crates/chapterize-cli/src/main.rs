use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use chapterize_config::{self, Config};
use chapterize_core::orchestrator::{self, RunOutcome, RunRequest};
use chapterize_state::ManifestStore;
use chapterize_types::{ErrorCategory, Mode};

#[derive(Parser, Debug)]
#[command(
    name = "chapterize",
    version,
    about = "Convert a directory of audio files (or an existing M4B) into a chaptered, metadata-enriched audiobook and deploy it into a Plex library"
)]
struct Cli {
    /// Source directory (convert mode) or .m4b file (enrich/metadata/organize modes).
    source: PathBuf,

    /// Pipeline mode. Auto-detected from the source shape when omitted.
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Log what would happen without mutating anything.
    #[arg(long)]
    dry_run: bool,

    /// Reprocess even if the manifest already reports this book as completed.
    #[arg(long)]
    force: bool,

    /// Emit DEBUG-level log lines in addition to INFO/WARN/ERROR.
    #[arg(long)]
    verbose: bool,

    /// Skip the global pipeline lock (for deployments that parallelize across books at the process level).
    #[arg(long)]
    no_lock: bool,

    /// Override ASIN discovery with a specific 10-character catalog identifier.
    #[arg(long)]
    asin: Option<String>,

    /// Path to a TOML config file. Environment variables still override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Mirrors [`chapterize_types::Mode`] for clap's `ValueEnum`, since clap
/// needs `Copy + ValueEnum` on the type it parses into and adding that to
/// the domain type would pull a CLI-only dependency into `chapterize-types`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Convert,
    Enrich,
    Metadata,
    Organize,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Convert => Mode::Convert,
            CliMode::Enrich => Mode::Enrich,
            CliMode::Metadata => Mode::MetadataOnly,
            CliMode::Organize => Mode::OrganizeOnly,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if !cli.source.exists() {
        eprintln!("error: source path does not exist: {}", cli.source.display());
        return Ok(ExitCode::from(2));
    }

    let mut config = chapterize_config::load_config(cli.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    apply_cli_overrides(&mut config, &cli);

    let request = RunRequest {
        source: &cli.source,
        mode: cli.mode.map(Mode::from),
        asin_override: cli.asin.as_deref(),
        config: &config,
        dry_run: config.behavior.dry_run,
        no_lock: cli.no_lock,
        force: config.behavior.force,
    };

    let outcome = orchestrator::run(&request).context("pipeline run failed")?;
    Ok(exit_code_for(&outcome, &config, &cli.source))
}

/// CLI flags are overlaid on top of file+env config last: defaults <
/// file < environment < explicit flags for this run.
fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if cli.dry_run {
        config.behavior.dry_run = true;
    }
    if cli.force {
        config.behavior.force = true;
    }
    if cli.verbose {
        config.behavior.verbose = true;
        config.behavior.log_level = "debug".to_string();
    }
}

/// Map a [`RunOutcome`] to a process exit code: 0 for success or a benign
/// skip, 2-3 for a permanent failure, any other non-zero for a transient
/// one. `Quarantined` can be either a permanent error or a transient one
/// that exhausted its retry budget, so the manifest's `last_error` is
/// consulted to tell them apart.
fn exit_code_for(outcome: &RunOutcome, config: &Config, source: &std::path::Path) -> ExitCode {
    match outcome {
        RunOutcome::Completed | RunOutcome::AlreadyComplete | RunOutcome::LockContended => ExitCode::SUCCESS,
        RunOutcome::RetryLater => ExitCode::from(1),
        RunOutcome::Quarantined => quarantine_exit_code(config, source),
    }
}

fn quarantine_exit_code(config: &Config, source: &std::path::Path) -> ExitCode {
    let Ok(hash) = chapterize_core::hash::book_hash(source) else {
        return ExitCode::from(1);
    };
    let store = ManifestStore::new(&config.paths.manifest_dir);
    let category = store
        .read(&hash)
        .ok()
        .flatten()
        .and_then(|m| m.last_error.map(|e| e.category));
    match category {
        Some(ErrorCategory::Permanent) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}
