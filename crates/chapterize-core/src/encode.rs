//! Wraps the external concat+encode tool. It only builds the inputs (concat
//! list, chapter metadata) and the argument list, and reports the encoder's
//! exit status back to the stage.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::chapters::Chapter;
use crate::process::Runner;

/// Floor applied to the selected output bitrate.
pub const MIN_BITRATE_KBPS: u32 = 64;

const ENCODE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 6);

pub fn encoder_program() -> String {
    std::env::var("CHAPTERIZE_ENCODER_BIN").unwrap_or_else(|_| "ffmpeg".to_string())
}

/// Whether a hardware AAC encoder is available on this host. Real detection
/// belongs to the external tool; this binary only decides which codec name
/// to pass, via an env override: the hardware encoder is used when
/// detected on the host, software AAC otherwise.
pub fn hardware_encoder_available() -> bool {
    std::env::var("CHAPTERIZE_HW_AAC_ENCODER").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

pub fn select_codec_name() -> &'static str {
    if hardware_encoder_available() { "aac_at" } else { "aac" }
}

/// `min(source_kbps, max_bitrate)`, floored at [`MIN_BITRATE_KBPS`].
pub fn select_bitrate_kbps(source_kbps: u32, max_bitrate_kbps: u32) -> u32 {
    source_kbps.min(max_bitrate_kbps).max(MIN_BITRATE_KBPS)
}

/// Write the concat demuxer's file list: one `file '<path>'` line per input,
/// in the order given (requires them already sorted).
pub fn write_concat_list(work_dir: &Path, files: &[PathBuf]) -> Result<PathBuf> {
    let path = work_dir.join("concat_list.txt");
    let mut content = String::new();
    for file in files {
        let escaped = file.to_string_lossy().replace('\'', "'\\''");
        let _ = writeln!(content, "file '{escaped}'");
    }
    std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Write the FFMETADATA chapter file the encoder maps onto the output
/// stream, chapter metadata mapped in from the generated metadata file.
pub fn write_chapter_metadata(work_dir: &Path, chapters: &[Chapter]) -> Result<Option<PathBuf>> {
    if chapters.is_empty() {
        return Ok(None);
    }
    let path = work_dir.join("chapters.metadata");
    let mut content = String::from(";FFMETADATA1\n");
    for chapter in chapters {
        let _ = writeln!(content, "[CHAPTER]");
        let _ = writeln!(content, "TIMEBASE=1/1000");
        let _ = writeln!(content, "START={}", chapter.start_ms);
        let _ = writeln!(content, "END={}", chapter.end_ms);
        let _ = writeln!(content, "title={}", chapter.title);
    }
    std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

pub struct EncodeRequest<'a> {
    pub concat_list: &'a Path,
    pub chapter_metadata: Option<&'a Path>,
    pub output_path: &'a Path,
    pub bitrate_kbps: u32,
    pub channels: u8,
}

/// Run the single-pass encode invocation: concat demuxer input, AAC at the
/// chosen bitrate, chapter metadata mapped in when present, `+faststart`.
pub fn run_encode(runner: &Runner, work_dir: &Path, request: &EncodeRequest<'_>) -> Result<()> {
    let bitrate_arg = format!("{}k", request.bitrate_kbps);
    let channels_arg = request.channels.to_string();
    let output_arg = request.output_path.to_string_lossy().into_owned();
    let concat_arg = request.concat_list.to_string_lossy().into_owned();

    let mut args: Vec<&str> = vec![
        "-y",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        concat_arg.as_str(),
    ];

    let chapter_arg = request.chapter_metadata.map(|p| p.to_string_lossy().into_owned());
    if let Some(chapter_arg) = &chapter_arg {
        args.extend(["-i", chapter_arg.as_str(), "-map_metadata", "1"]);
    }

    let codec = select_codec_name();
    args.extend([
        "-c:a",
        codec,
        "-b:a",
        bitrate_arg.as_str(),
        "-ac",
        channels_arg.as_str(),
        "-ar",
        "44100",
        "-movflags",
        "+faststart",
        output_arg.as_str(),
    ]);

    let output = runner.run(&encoder_program(), &args, work_dir, Some(ENCODE_TIMEOUT), "")?;
    if !output.success() {
        anyhow::bail!(
            "encode failed (exit {}): {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(())
}
