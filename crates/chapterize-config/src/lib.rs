//! Configuration loading for the chapterize pipeline.
//!
//! Three layers, lowest to highest precedence: built-in defaults, an
//! optional TOML file (`--config <path>`), then environment variables.
//! Every field in the TOML schema mirrors one row of the environment
//! variable table so either source (or both, for different fields) can be
//! used interchangeably.
//!
//! # Example
//!
//! ```
//! use chapterize_config::Config;
//!
//! let config = Config::default();
//! assert_eq!(config.audio.max_bitrate_kbps, 64);
//! assert_eq!(config.retry.max_retries, 3);
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_nfs_output_dir")]
    pub nfs_output_dir: PathBuf,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    #[serde(default = "default_failed_dir")]
    pub failed_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/chapterize/work")
}
fn default_manifest_dir() -> PathBuf {
    PathBuf::from("/var/lib/chapterize/manifests")
}
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock/chapterize")
}
fn default_nfs_output_dir() -> PathBuf {
    PathBuf::from("/mnt/library/Audiobooks")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("/mnt/library/Archive")
}
fn default_failed_dir() -> PathBuf {
    PathBuf::from("/mnt/library/Failed")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/chapterize")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            manifest_dir: default_manifest_dir(),
            lock_dir: default_lock_dir(),
            nfs_output_dir: default_nfs_output_dir(),
            archive_dir: default_archive_dir(),
            failed_dir: default_failed_dir(),
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_max_bitrate", rename = "max_bitrate")]
    pub max_bitrate_kbps: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
}

fn default_max_bitrate() -> u32 {
    64
}
fn default_channels() -> u8 {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_bitrate_kbps: default_max_bitrate(),
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSourcePreference {
    Primary,
    Fallback,
}

impl Default for MetadataSourcePreference {
    fn default() -> Self {
        MetadataSourcePreference::Primary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default, rename = "source")]
    pub source: MetadataSourcePreference,
    #[serde(default = "default_region", rename = "audible_region")]
    pub audible_region: String,
    #[serde(default = "default_region", rename = "audnexus_region")]
    pub audnexus_region: String,
    #[serde(default = "default_cache_days", rename = "audnexus_cache_days")]
    pub cache_days: u64,
    #[serde(
        default = "default_chapter_duration_tolerance",
        rename = "chapter_duration_tolerance"
    )]
    pub chapter_duration_tolerance_pct: f64,
}

fn default_region() -> String {
    "us".to_string()
}
fn default_cache_days() -> u64 {
    30
}
fn default_chapter_duration_tolerance() -> f64 {
    5.0
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            source: MetadataSourcePreference::default(),
            audible_region: default_region(),
            audnexus_region: default_region(),
            cache_days: default_cache_days(),
            chapter_duration_tolerance_pct: default_chapter_duration_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_mode: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_cleanup_work_dir")]
    pub cleanup_work_dir: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cleanup_work_dir() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            verbose: false,
            cleanup_work_dir: default_cleanup_work_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Load config from a TOML file, falling back to all-defaults if the path
/// doesn't exist. A missing `--config` path is not an error: every option
/// has an environment-variable fallback.
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Apply environment variable overrides on top of a loaded config. Env
/// vars always win over the file: the environment is the final authority
/// for a process invoked by an external scheduler.
pub fn apply_env_overrides(config: &mut Config) {
    use std::env;

    if let Ok(v) = env::var("WORK_DIR") {
        config.paths.work_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("MANIFEST_DIR") {
        config.paths.manifest_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("LOCK_DIR") {
        config.paths.lock_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("NFS_OUTPUT_DIR") {
        config.paths.nfs_output_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("ARCHIVE_DIR") {
        config.paths.archive_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("FAILED_DIR") {
        config.paths.failed_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("LOG_DIR") {
        config.paths.log_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("MAX_BITRATE") {
        if let Ok(n) = v.parse() {
            config.audio.max_bitrate_kbps = n;
        }
    }
    if let Ok(v) = env::var("CHANNELS") {
        if let Ok(n) = v.parse() {
            config.audio.channels = n;
        }
    }
    if let Ok(v) = env::var("METADATA_SOURCE") {
        config.metadata.source = match v.as_str() {
            "fallback" => MetadataSourcePreference::Fallback,
            _ => MetadataSourcePreference::Primary,
        };
    }
    if let Ok(v) = env::var("AUDIBLE_REGION") {
        config.metadata.audible_region = v;
    }
    if let Ok(v) = env::var("AUDNEXUS_REGION") {
        config.metadata.audnexus_region = v;
    }
    if let Ok(v) = env::var("AUDNEXUS_CACHE_DAYS") {
        if let Ok(n) = v.parse() {
            config.metadata.cache_days = n;
        }
    }
    if let Ok(v) = env::var("CHAPTER_DURATION_TOLERANCE") {
        if let Ok(n) = v.parse() {
            config.metadata.chapter_duration_tolerance_pct = n;
        }
    }
    if let Ok(v) = env::var("MAX_RETRIES") {
        if let Ok(n) = v.parse() {
            config.retry.max_retries = n;
        }
    }
    if let Ok(v) = env::var("FAILURE_WEBHOOK_URL") {
        config.webhook.url = Some(v);
    }
    if let Ok(v) = env::var("FILE_OWNER") {
        config.permissions.file_owner = Some(v);
    }
    if let Ok(v) = env::var("FILE_MODE") {
        if let Ok(n) = u32::from_str_radix(v.trim_start_matches("0o"), 8) {
            config.permissions.file_mode = Some(n);
        }
    }
    if let Ok(v) = env::var("DIR_MODE") {
        if let Ok(n) = u32::from_str_radix(v.trim_start_matches("0o"), 8) {
            config.permissions.dir_mode = Some(n);
        }
    }
    if let Ok(v) = env::var("DRY_RUN") {
        config.behavior.dry_run = is_truthy(&v);
    }
    if let Ok(v) = env::var("FORCE") {
        config.behavior.force = is_truthy(&v);
    }
    if let Ok(v) = env::var("VERBOSE") {
        config.behavior.verbose = is_truthy(&v);
    }
    if let Ok(v) = env::var("CLEANUP_WORK_DIR") {
        config.behavior.cleanup_work_dir = is_truthy(&v);
    }
    if let Ok(v) = env::var("LOG_LEVEL") {
        config.behavior.log_level = v;
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Load a config from an optional file path plus the environment, applying
/// the precedence defaults < file < environment.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => load_config_from_file(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.audio.max_bitrate_kbps, 64);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.metadata.cache_days, 30);
        assert!(!config.behavior.dry_run);
        assert!(config.behavior.cleanup_work_dir);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let td = tempdir().unwrap();
        let config = load_config_from_file(&td.path().join("nope.toml")).unwrap();
        assert_eq!(config.audio.max_bitrate_kbps, 64);
    }

    #[test]
    fn parses_full_toml_document() {
        let td = tempdir().unwrap();
        let path = td.path().join("chapterize.toml");
        std::fs::write(
            &path,
            r#"
[paths]
work_dir = "/tmp/work"
manifest_dir = "/tmp/manifests"

[audio]
max_bitrate = 128
channels = 2

[metadata]
source = "fallback"
audnexus_cache_days = 7

[retry]
max_retries = 5

[webhook]
url = "https://hooks.example.com/chapterize"

[permissions]
file_owner = "media:media"
file_mode = 0o640

[behavior]
verbose = true
"#,
        )
        .unwrap();

        let config = load_config_from_file(&path).unwrap();
        assert_eq!(config.paths.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.audio.max_bitrate_kbps, 128);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.metadata.source, MetadataSourcePreference::Fallback);
        assert_eq!(config.metadata.cache_days, 7);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(
            config.webhook.url.as_deref(),
            Some("https://hooks.example.com/chapterize")
        );
        assert_eq!(config.permissions.file_owner.as_deref(), Some("media:media"));
        assert_eq!(config.permissions.file_mode, Some(0o640));
        assert!(config.behavior.verbose);
    }

    #[test]
    #[serial]
    fn env_overrides_win_over_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("chapterize.toml");
        std::fs::write(&path, "[retry]\nmax_retries = 5\n").unwrap();

        unsafe {
            std::env::set_var("MAX_RETRIES", "9");
        }
        let config = load_config(Some(&path)).unwrap();
        unsafe {
            std::env::remove_var("MAX_RETRIES");
        }

        assert_eq!(config.retry.max_retries, 9);
    }

    #[test]
    #[serial]
    fn env_dry_run_accepts_truthy_strings() {
        unsafe {
            std::env::set_var("DRY_RUN", "yes");
        }
        let config = load_config(None).unwrap();
        unsafe {
            std::env::remove_var("DRY_RUN");
        }
        assert!(config.behavior.dry_run);
    }

    #[test]
    #[serial]
    fn env_file_mode_parses_octal() {
        unsafe {
            std::env::set_var("FILE_MODE", "0644");
        }
        let config = load_config(None).unwrap();
        unsafe {
            std::env::remove_var("FILE_MODE");
        }
        assert_eq!(config.permissions.file_mode, Some(0o644));
    }
}
