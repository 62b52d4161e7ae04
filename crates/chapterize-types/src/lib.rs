//! Core domain types for the audiobook pipeline orchestrator.
//!
//! This crate defines the vocabulary shared by every other `chapterize`
//! crate: pipeline stages and their order, error classification, and the
//! normalized catalog schema that both metadata clients deserialize into.
//!
//! Keeping these types in a leaf crate (no dependency on `chapterize-core`)
//! lets manifest, retry, and config code all build on the shared vocabulary
//! without pulling in the orchestrator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a human-readable string (`"30d"`) or
/// a raw integer (milliseconds), so config and cache TTLs can be written
/// either way in TOML/JSON.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds, round-tripping with
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The 16-hex-character book identity, computed by `chapterize-core`'s
/// hashing module and threaded through every other crate as an opaque key.
pub type BookHash = String;

/// Which end-to-end shape the pipeline is running.
///
/// Determines which prefix/suffix of [`StageName::canonical_order`] is
/// pre-marked `completed` at manifest creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Directory of source audio files -> new M4B.
    Convert,
    /// Input is already a single M4B; skip validate/concat/convert.
    Enrich,
    /// Only (re-)run the metadata stage against an already-organized book.
    MetadataOnly,
    /// Only (re-)run the organize stage.
    OrganizeOnly,
}

impl Mode {
    /// Detect a mode from the source path shape when none is given
    /// explicitly: a directory implies `Convert`, a `.m4b` file implies
    /// `Enrich`.
    pub fn detect(source_is_dir: bool, source_extension: Option<&str>) -> Mode {
        if source_is_dir {
            Mode::Convert
        } else if source_extension.is_some_and(|ext| ext.eq_ignore_ascii_case("m4b")) {
            Mode::Enrich
        } else {
            Mode::Convert
        }
    }
}

/// The eight pipeline stages, in their canonical execution order.
///
/// Validation and splitting run before encode, and metadata/deploy run
/// last, so a failure at any stage leaves earlier, cheaper work already
/// recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Validate,
    Concat,
    Convert,
    Asin,
    Metadata,
    Organize,
    Archive,
    Cleanup,
}

impl StageName {
    /// The canonical, fixed stage order. Every mode pre-marks a prefix or
    /// suffix of this sequence as already-completed; none of them reorder it.
    pub const CANONICAL_ORDER: [StageName; 8] = [
        StageName::Validate,
        StageName::Concat,
        StageName::Convert,
        StageName::Asin,
        StageName::Metadata,
        StageName::Organize,
        StageName::Archive,
        StageName::Cleanup,
    ];

    /// Stages this mode pre-marks `completed` at manifest creation time,
    /// because the mode's input already satisfies them.
    pub fn prefilled_for_mode(mode: Mode) -> &'static [StageName] {
        match mode {
            Mode::Convert => &[],
            // Enrich starts from an existing M4B: validate/concat/convert
            // are moot, resume begins at asin.
            Mode::Enrich => &[StageName::Validate, StageName::Concat, StageName::Convert],
            // metadata-only assumes the book is already converted and will
            // be organized again by a later manual/automated step.
            Mode::MetadataOnly => &[
                StageName::Validate,
                StageName::Concat,
                StageName::Convert,
                StageName::Asin,
            ],
            // organize-only assumes conversion and metadata enrichment are
            // already done; only placement is pending.
            Mode::OrganizeOnly => &[
                StageName::Validate,
                StageName::Concat,
                StageName::Convert,
                StageName::Asin,
                StageName::Metadata,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Validate => "validate",
            StageName::Concat => "concat",
            StageName::Convert => "convert",
            StageName::Asin => "asin",
            StageName::Metadata => "metadata",
            StageName::Organize => "organize",
            StageName::Archive => "archive",
            StageName::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage record within a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Completed,
    Failed,
}

/// Overall manifest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Error taxonomy for a failed stage. `GracefulSkip` is deliberately not a
/// variant here: graceful skips are handled entirely within a stage (it logs
/// a warning and completes) and never reach the orchestrator's error trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permanent,
    Transient,
}

impl ErrorCategory {
    /// Classify an external tool's exit code per the pipeline contract: 2 or 3 is
    /// permanent, anything else non-zero is transient.
    pub fn from_exit_code(code: i32) -> ErrorCategory {
        match code {
            2 | 3 => ErrorCategory::Permanent,
            _ => ErrorCategory::Transient,
        }
    }
}

/// Recorded context for the most recent failure, stored in the manifest's
/// `last_error` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub stage: StageName,
    pub timestamp: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub message: String,
    pub category: ErrorCategory,
}

/// Where a discovered ASIN came from, for manifest bookkeeping and for
/// deciding whether it needs `unvalidated` tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsinSource {
    CliOverride,
    MarkerFile,
    FolderName,
    LibraryApi,
    CatalogSearch,
    /// Format-valid but never confirmed against the aggregator, because the
    /// aggregator was unreachable for at least one attempt during discovery.
    UnvalidatedFallback,
}

/// Which catalog normalized this payload, so downstream code can tell
/// `primary`-only fields (subtitle, copyright, isbn, rating) from ones
/// guaranteed by both sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedNarrator {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPrimary {
    pub name: String,
    /// Series position; kept as `f64` because the catalogs allow values
    /// like `1.5` for novellas slotted between numbered entries.
    pub position: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genre {
    pub name: String,
}

/// One chapter as returned by a catalog, before the duration gate decides
/// whether it is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedChapter {
    pub length_ms: u64,
    pub start_offset_ms: u64,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedChapters {
    pub is_accurate: bool,
    pub runtime_length_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_intro_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_outro_duration_ms: Option<u64>,
    pub chapters: Vec<NormalizedChapter>,
}

/// The schema both metadata clients normalize into . Every
/// field but `asin`, `title`, and `authors` is optional so downstream code
/// never has to distinguish which catalog answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedBook {
    pub asin: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub authors: Vec<NormalizedAuthor>,
    #[serde(default)]
    pub narrators: Vec<NormalizedNarrator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_primary: Option<SeriesPrimary>,
    #[serde(default)]
    pub genres: Vec<Genre>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// ISO8601 date or bare year, exactly as the catalog returned it; callers
    /// normalize via [`normalize_release_date`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapters: Option<NormalizedChapters>,
    #[serde(rename = "_source")]
    pub source: MetadataSource,
}

/// Normalize a catalog `releaseDate` to `YYYY-MM-DD`: a bare 4-digit year
/// gets `-01-01` appended; anything else passes through.
pub fn normalize_release_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 4 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("{trimmed}-01-01")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_detect_directory_is_convert() {
        assert_eq!(Mode::detect(true, None), Mode::Convert);
    }

    #[test]
    fn mode_detect_m4b_is_enrich() {
        assert_eq!(Mode::detect(false, Some("m4b")), Mode::Enrich);
        assert_eq!(Mode::detect(false, Some("M4B")), Mode::Enrich);
    }

    #[test]
    fn mode_detect_other_file_falls_back_to_convert() {
        assert_eq!(Mode::detect(false, Some("mp3")), Mode::Convert);
        assert_eq!(Mode::detect(false, None), Mode::Convert);
    }

    #[test]
    fn canonical_order_has_eight_stages_in_spec_order() {
        assert_eq!(StageName::CANONICAL_ORDER.len(), 8);
        assert_eq!(StageName::CANONICAL_ORDER[0], StageName::Validate);
        assert_eq!(StageName::CANONICAL_ORDER[7], StageName::Cleanup);
    }

    #[test]
    fn prefilled_for_enrich_covers_validate_concat_convert_only() {
        let prefilled = StageName::prefilled_for_mode(Mode::Enrich);
        assert_eq!(
            prefilled,
            &[StageName::Validate, StageName::Concat, StageName::Convert]
        );
    }

    #[test]
    fn prefilled_for_convert_is_empty() {
        assert!(StageName::prefilled_for_mode(Mode::Convert).is_empty());
    }

    #[test]
    fn error_category_from_exit_code() {
        assert_eq!(ErrorCategory::from_exit_code(2), ErrorCategory::Permanent);
        assert_eq!(ErrorCategory::from_exit_code(3), ErrorCategory::Permanent);
        assert_eq!(ErrorCategory::from_exit_code(1), ErrorCategory::Transient);
        assert_eq!(ErrorCategory::from_exit_code(137), ErrorCategory::Transient);
    }

    #[test]
    fn normalize_release_date_expands_bare_year() {
        assert_eq!(normalize_release_date("2019"), "2019-01-01");
    }

    #[test]
    fn normalize_release_date_passes_through_full_date() {
        assert_eq!(normalize_release_date("2019-03-14"), "2019-03-14");
    }

    #[test]
    fn duration_roundtrips_through_serde_json() {
        let d = Duration::from_millis(30 * 24 * 60 * 60 * 1000);
        #[derive(Serialize, Deserialize)]
        struct Wrap(
            #[serde(
                serialize_with = "serialize_duration",
                deserialize_with = "deserialize_duration"
            )]
            Duration,
        );
        let json = serde_json::to_string(&Wrap(d)).unwrap();
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, d);
    }

    #[test]
    fn duration_parses_human_readable_string() {
        #[derive(Deserialize)]
        struct Wrap(#[serde(deserialize_with = "deserialize_duration")] Duration);
        let w: Wrap = serde_json::from_str("\"30d\"").unwrap();
        assert_eq!(w.0, Duration::from_secs(30 * 24 * 60 * 60));
    }

    #[test]
    fn normalized_book_serializes_with_source_tag() {
        let book = NormalizedBook {
            asin: "B002V5D1CG".to_string(),
            title: "Test Book".to_string(),
            subtitle: None,
            authors: vec![NormalizedAuthor {
                name: "Author One".to_string(),
                id: None,
            }],
            narrators: vec![],
            series_primary: None,
            genres: vec![],
            genre_path: None,
            description: None,
            summary: None,
            release_date: None,
            image: None,
            copyright: None,
            publisher: None,
            isbn: None,
            language: None,
            rating: None,
            runtime_min: None,
            chapters: None,
            source: MetadataSource::Primary,
        };
        let json = serde_json::to_value(&book).unwrap();
        assert_eq!(json["_source"], "primary");
        assert_eq!(json["asin"], "B002V5D1CG");
    }
}
