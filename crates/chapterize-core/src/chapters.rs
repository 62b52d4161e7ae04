//! Chapter synthesis from file boundaries and the catalog
//! chapter duration gate.

use std::path::Path;

use chapterize_types::NormalizedChapters;

/// One chapter entry, in milliseconds, ready to format for the tagger.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub start_ms: u64,
    pub end_ms: u64,
    pub title: String,
}

/// Build file-boundary chapters from each input file's probed duration.
/// A single-file input yields no chapters.
pub fn synthesize_from_durations(files: &[(&Path, f64)]) -> Vec<Chapter> {
    if files.len() < 2 {
        return Vec::new();
    }

    let mut chapters = Vec::with_capacity(files.len());
    let mut cursor_ms = 0u64;
    for (path, duration_s) in files {
        let duration_ms = (duration_s * 1000.0).round() as u64;
        let start_ms = cursor_ms;
        let end_ms = cursor_ms + duration_ms;
        chapters.push(Chapter {
            start_ms,
            end_ms,
            title: chapter_title_from_filename(path),
        });
        cursor_ms = end_ms;
    }
    chapters
}

/// Basename with extension stripped, sanitized for use as a chapter title.
pub fn chapter_title_from_filename(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chapter");
    crate::hash::sanitize_path_component(stem)
}

/// Outcome of the duration gate: either the catalog's own chapter
/// boundaries are close enough to the probed total to trust, or the
/// file-boundary chapters built during convert should be kept.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterGateOutcome {
    UseCatalog(Vec<Chapter>),
    KeepFileBoundary,
}

/// Compare the catalog's declared
/// `runtime_length_ms` against the probed duration; within `tolerance_pct`
/// percent, convert and use the catalog chapters (after validating they are
/// non-negative, non-overlapping, and monotonic); otherwise keep the
/// file-boundary chapters and report why.
pub fn apply_duration_gate(
    catalog: Option<&NormalizedChapters>,
    probed_duration_ms: u64,
    tolerance_pct: f64,
) -> ChapterGateOutcome {
    let Some(catalog) = catalog else {
        return ChapterGateOutcome::KeepFileBoundary;
    };
    if catalog.runtime_length_ms == 0 {
        return ChapterGateOutcome::KeepFileBoundary;
    }

    let diff = probed_duration_ms.abs_diff(catalog.runtime_length_ms);
    let pct = (diff as f64 / catalog.runtime_length_ms as f64) * 100.0;
    if pct > tolerance_pct {
        return ChapterGateOutcome::KeepFileBoundary;
    }

    match validated_catalog_chapters(catalog) {
        Some(chapters) => ChapterGateOutcome::UseCatalog(chapters),
        None => ChapterGateOutcome::KeepFileBoundary,
    }
}

/// Reject chapter sets with negative offsets (impossible given `u64`, kept
/// for clarity), overlapping ranges, or non-monotonic starts.
fn validated_catalog_chapters(catalog: &NormalizedChapters) -> Option<Vec<Chapter>> {
    let mut out = Vec::with_capacity(catalog.chapters.len());
    let mut previous_end = 0u64;
    for (i, raw) in catalog.chapters.iter().enumerate() {
        if i > 0 && raw.start_offset_ms < previous_end {
            return None;
        }
        let end_ms = raw.start_offset_ms + raw.length_ms;
        out.push(Chapter {
            start_ms: raw.start_offset_ms,
            end_ms,
            title: raw.title.clone(),
        });
        previous_end = end_ms;
    }
    Some(out)
}

/// Format one chapter's start time as `HH:MM:SS.mmm`, the shape the tagger
/// collaborator expects.
pub fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Render chapters into `HH:MM:SS.mmm Title` lines, one per chapter, the
/// format the tagger's `--chapters <file>` input expects.
pub fn format_chapter_file(chapters: &[Chapter]) -> String {
    chapters
        .iter()
        .map(|c| format!("{} {}\n", format_timestamp(c.start_ms), c.title))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapterize_types::NormalizedChapter;
    use std::path::PathBuf;

    #[test]
    fn single_file_yields_no_chapters() {
        let path = PathBuf::from("/in/book.m4b");
        let chapters = synthesize_from_durations(&[(path.as_path(), 3600.0)]);
        assert!(chapters.is_empty());
    }

    #[test]
    fn multi_file_chapters_are_contiguous() {
        let ch1 = PathBuf::from("/in/ch1.mp3");
        let ch2 = PathBuf::from("/in/ch2.mp3");
        let chapters = synthesize_from_durations(&[(ch1.as_path(), 300.0), (ch2.as_path(), 600.0)]);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].start_ms, 0);
        assert_eq!(chapters[0].end_ms, 300_000);
        assert_eq!(chapters[0].title, "ch1");
        assert_eq!(chapters[1].start_ms, 300_000);
        assert_eq!(chapters[1].end_ms, 900_000);
    }

    fn sample_catalog(runtime_ms: u64) -> NormalizedChapters {
        NormalizedChapters {
            is_accurate: true,
            runtime_length_ms: runtime_ms,
            brand_intro_duration_ms: None,
            brand_outro_duration_ms: None,
            chapters: vec![
                NormalizedChapter { length_ms: 300_000, start_offset_ms: 0, title: "Chapter 1".into() },
                NormalizedChapter { length_ms: 600_000, start_offset_ms: 300_000, title: "Chapter 2".into() },
            ],
        }
    }

    #[test]
    fn gate_accepts_catalog_within_tolerance() {
        let catalog = sample_catalog(900_000);
        let outcome = apply_duration_gate(Some(&catalog), 900_500, 5.0);
        match outcome {
            ChapterGateOutcome::UseCatalog(chapters) => assert_eq!(chapters.len(), 2),
            other => panic!("expected UseCatalog, got {other:?}"),
        }
    }

    #[test]
    fn gate_rejects_catalog_outside_tolerance() {
        let catalog = sample_catalog(800_000);
        let outcome = apply_duration_gate(Some(&catalog), 900_000, 5.0);
        assert_eq!(outcome, ChapterGateOutcome::KeepFileBoundary);
    }

    #[test]
    fn gate_rejects_non_monotonic_catalog_chapters() {
        let mut catalog = sample_catalog(900_000);
        catalog.chapters[1].start_offset_ms = 100_000;
        let outcome = apply_duration_gate(Some(&catalog), 900_000, 5.0);
        assert_eq!(outcome, ChapterGateOutcome::KeepFileBoundary);
    }

    #[test]
    fn gate_with_no_catalog_keeps_file_boundary() {
        assert_eq!(apply_duration_gate(None, 900_000, 5.0), ChapterGateOutcome::KeepFileBoundary);
    }

    #[test]
    fn format_timestamp_pads_correctly() {
        assert_eq!(format_timestamp(0), "00:00:00.000");
        assert_eq!(format_timestamp(3_661_500), "01:01:01.500");
    }

    #[test]
    fn format_chapter_file_joins_lines() {
        let chapters = vec![
            Chapter { start_ms: 0, end_ms: 300_000, title: "Intro".into() },
            Chapter { start_ms: 300_000, end_ms: 900_000, title: "Chapter Two".into() },
        ];
        let rendered = format_chapter_file(&chapters);
        assert_eq!(rendered, "00:00:00.000 Intro\n00:05:00.000 Chapter Two\n");
    }
}
