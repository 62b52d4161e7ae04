//! Book identity hashing and filesystem-safe name sanitization.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::probe::AUDIO_EXTENSIONS;

/// Characters the Plex path builder must never let through a path
/// component.
const UNSAFE_PATH_CHARS: &[char] = &['/', '\\', ':', '"', '*', '?', '<', '>', '|', ';'];

/// Maximum length, in bytes, of a single path component once sanitized.
const MAX_COMPONENT_BYTES: usize = 255;

/// Compute the 16-hex-character book identity.
///
/// For a directory: SHA-256 over the path followed by the sorted list of
/// recognized audio files within it. For a single file (enrich mode):
/// SHA-256 over the path followed by the file's byte size. Stable across
/// reruns with the same input, which is what lets the manifest store double
/// as an idempotency key.
pub fn book_hash(source: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(b"\n");

    if source.is_dir() {
        let mut files = collect_audio_files(source)?;
        sort_version_aware(&mut files);
        for file in &files {
            hasher.update(file.to_string_lossy().as_bytes());
            hasher.update(b"\n");
        }
    } else {
        let size = std::fs::metadata(source)?.len();
        hasher.update(size.to_le_bytes());
    }

    let digest = hasher.finalize();
    Ok(hex::encode(digest)[..16].to_string())
}

/// Sort paths in version-aware lexicographic order, so `ch2.mp3` sorts
/// before `ch10.mp3`: runs of ASCII digits compare by numeric value instead
/// of character-by-character.
pub fn sort_version_aware(files: &mut [std::path::PathBuf]) {
    files.sort_by(|a, b| {
        natural_sort_key(&a.to_string_lossy()).cmp(&natural_sort_key(&b.to_string_lossy()))
    });
}

/// Split a string into a sequence of (lowercased text, numeric) chunks so
/// two keys compare numerically within digit runs and lexicographically
/// everywhere else. `ch2` -> `[("ch", 0), ("", 2)]`, `ch10` -> `[("ch", 0),
/// ("", 10)]`, so `ch2 < ch10` even though `"2" > "1"` as raw characters.
fn natural_sort_key(s: &str) -> Vec<(String, u64)> {
    let mut chunks = Vec::new();
    let mut chars = s.chars().peekable();
    loop {
        let text: String = std::iter::from_fn(|| chars.next_if(|c| !c.is_ascii_digit()))
            .flat_map(|c| c.to_lowercase())
            .collect();
        let digits: String = std::iter::from_fn(|| chars.next_if(|c| c.is_ascii_digit())).collect();
        if text.is_empty() && digits.is_empty() {
            break;
        }
        let number = digits.parse().unwrap_or(0);
        chunks.push((text, number));
    }
    chunks
}

/// Recursively list files under `dir` whose extension is a recognized audio
/// type (case-insensitive), relative order unspecified (callers sort).
pub fn collect_audio_files(dir: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    collect_audio_files_into(dir, &mut out)?;
    Ok(out)
}

fn collect_audio_files_into(
    dir: &Path,
    out: &mut Vec<std::path::PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_audio_files_into(&path, out)?;
        } else if file_type.is_file() && has_audio_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

/// Sanitize one path component per the pipeline contract: replace unsafe characters
/// with spaces, collapse whitespace runs, trim leading/trailing dots and
/// whitespace, then truncate to 255 bytes without splitting a multi-byte
/// UTF-8 sequence.
pub fn sanitize_path_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if UNSAFE_PATH_CHARS.contains(&c) { ' ' } else { c })
        .collect();

    let collapsed = collapse_whitespace(&replaced);
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c.is_whitespace());

    truncate_utf8_safe(trimmed, MAX_COMPONENT_BYTES)
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// Truncate a string to at most `max_bytes` bytes, re-decoding lossily so a
/// partial trailing UTF-8 code point is dropped rather than corrupting the
/// string.
fn truncate_utf8_safe(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
