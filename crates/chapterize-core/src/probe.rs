//! Wraps the external audio-probe tool. Assumes a `ffprobe`-shaped CLI: JSON
//! on stdout via `-print_format json -show_format -show_streams -show_chapters`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::process::Runner;

/// Extensions validate recognizes as source audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "m4a", "wma"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn probe_program() -> String {
    std::env::var("CHAPTERIZE_PROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub duration_s: f64,
    pub codec_name: Option<String>,
    pub bit_rate_kbps: Option<u32>,
    pub format_name: Option<String>,
    pub chapter_count: u32,
    /// `format.tags.artist`/`format.tags.title` off the container, the
    /// organize stage's second-priority source for author/title (spec.md
    /// §4.8) when no catalog metadata is available.
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl ProbeReport {
    pub fn is_aac(&self) -> bool {
        self.codec_name.as_deref().is_some_and(|c| c.eq_ignore_ascii_case("aac"))
    }

    pub fn format_looks_like_mp4(&self) -> bool {
        self.format_name
            .as_deref()
            .is_some_and(|f| f.contains("mp4") || f.contains("mov"))
    }
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    #[serde(default)]
    format: Option<RawFormat>,
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    chapters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

/// ffprobe's tag keys are case-inconsistent across encoders/containers
/// (`artist`, `ARTIST`, `Artist`); look up case-insensitively instead of
/// betting on one casing.
fn find_tag(tags: &std::collections::HashMap<String, String>, key: &str) -> Option<String> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
        .filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct RawStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
}

/// Probe one audio file. Any parse failure or non-zero exit is surfaced as
/// an error; callers decide whether that's a permanent validate failure or
/// a transient post-encode duration check.
pub fn probe_file(runner: &Runner, path: &Path) -> Result<ProbeReport> {
    let working_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_arg = path.to_string_lossy().into_owned();

    let args = [
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        "-show_chapters",
        file_arg.as_str(),
    ];

    let fake_stdout = fake_probe_json(path);
    let output = runner.run(
        &probe_program(),
        &args,
        working_dir,
        Some(PROBE_TIMEOUT),
        &fake_stdout,
    )?;

    if !output.success() {
        bail!(
            "probe failed for {} (exit {}): {}",
            path.display(),
            output.exit_code,
            output.stderr.trim()
        );
    }

    parse_probe_output(&output.stdout)
        .with_context(|| format!("failed to parse probe output for {}", path.display()))
}

fn fake_probe_json(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let codec = if ext == "m4a" || ext == "m4b" { "aac" } else { "mp3" };
    format!(
        r#"{{"format":{{"duration":"1.0","bit_rate":"64000","format_name":"mov,mp4,m4a"}},"streams":[{{"codec_type":"audio","codec_name":"{codec}"}}],"chapters":[]}}"#
    )
}

fn parse_probe_output(stdout: &str) -> Result<ProbeReport> {
    let raw: RawProbe = serde_json::from_str(stdout).context("invalid probe JSON")?;

    let duration_s = raw
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let bit_rate_kbps = raw
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u64>().ok())
        .map(|bps| (bps / 1000) as u32);

    let format_name = raw.format.as_ref().and_then(|f| f.format_name.clone());

    let codec_name = raw
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.codec_name.clone());

    let (artist, title) = raw
        .format
        .as_ref()
        .map(|f| (find_tag(&f.tags, "artist"), find_tag(&f.tags, "title")))
        .unwrap_or((None, None));

    Ok(ProbeReport {
        duration_s,
        codec_name,
        bit_rate_kbps,
        format_name,
        chapter_count: raw.chapters.len() as u32,
        artist,
        title,
    })
}
