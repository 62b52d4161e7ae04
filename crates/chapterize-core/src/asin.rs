//! ASIN discovery : produce a validated 10-character
//! uppercase alphanumeric identifier for a source directory or M4B file, by
//! walking a priority chain and short-circuiting on the first validated hit.

use std::path::Path;

use anyhow::Result;
use chapterize_metadata::{FallbackAggregatorClient, SearchCandidate};
use chapterize_types::AsinSource;
use regex::Regex;

const ASIN_LEN: usize = 10;

/// A discovered ASIN and the step of the chain that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AsinDiscovery {
    pub asin: String,
    pub source: AsinSource,
}

/// Whether `candidate` has the general ASIN shape: exactly 10 uppercase
/// alphanumeric characters. Folder-name matches additionally require a `B0`
/// prefix (checked separately in [`extract_folder_asin`]); CLI overrides and
/// marker files only need this general shape.
pub fn is_format_valid(candidate: &str) -> bool {
    candidate.len() == ASIN_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

enum Attempt {
    Valid,
    Invalid,
    Unreachable,
}

fn try_validate(fallback: &FallbackAggregatorClient, candidate: &str) -> Attempt {
    match fallback.check_asin_exists(candidate) {
        Ok(true) => Attempt::Valid,
        Ok(false) => Attempt::Invalid,
        Err(_) => Attempt::Unreachable,
    }
}

/// Run the full discovery chain against `source` (a book directory or a
/// single M4B file), short-circuiting on the first validated candidate.
///
/// `cli_override` is whatever `--asin` was passed on the command line, if
/// any. `score_threshold` gates the fuzzy catalog search.
pub fn discover_asin(
    source: &Path,
    cli_override: Option<&str>,
    fallback: &FallbackAggregatorClient,
    score_threshold: f64,
) -> Result<Option<AsinDiscovery>> {
    let mut aggregator_unreachable = false;
    let mut unvalidated_fallback: Option<AsinDiscovery> = None;

    // 1. CLI override.
    if let Some(raw) = cli_override {
        let candidate = raw.trim().to_ascii_uppercase();
        if is_format_valid(&candidate) {
            match try_validate(fallback, &candidate) {
                Attempt::Valid => {
                    return Ok(Some(AsinDiscovery {
                        asin: candidate,
                        source: AsinSource::CliOverride,
                    }));
                }
                Attempt::Unreachable => {
                    aggregator_unreachable = true;
                    unvalidated_fallback.get_or_insert(AsinDiscovery {
                        asin: candidate,
                        source: AsinSource::CliOverride,
                    });
                }
                Attempt::Invalid => {}
            }
        }
    }

    // 2. Marker file (`.asin` next to the source).
    if let Some(raw) = read_marker_file(source) {
        let candidate = raw.trim().to_ascii_uppercase();
        if is_format_valid(&candidate) {
            match try_validate(fallback, &candidate) {
                Attempt::Valid => {
                    return Ok(Some(AsinDiscovery {
                        asin: candidate,
                        source: AsinSource::MarkerFile,
                    }));
                }
                Attempt::Unreachable => {
                    aggregator_unreachable = true;
                    unvalidated_fallback.get_or_insert(AsinDiscovery {
                        asin: candidate,
                        source: AsinSource::MarkerFile,
                    });
                }
                Attempt::Invalid => {}
            }
        }
    }

    // 3. Folder-name regex (`[ASIN]`, `(ASIN)`, or a leading `ASIN - ` token).
    if let Some(candidate) = extract_folder_asin(source) {
        match try_validate(fallback, &candidate) {
            Attempt::Valid => {
                return Ok(Some(AsinDiscovery {
                    asin: candidate,
                    source: AsinSource::FolderName,
                }));
            }
            Attempt::Unreachable => {
                aggregator_unreachable = true;
                unvalidated_fallback.get_or_insert(AsinDiscovery {
                    asin: candidate,
                    source: AsinSource::FolderName,
                });
            }
            Attempt::Invalid => {}
        }
    }

    // 4. External library API. Stubbed: always reports not-found, since no
    // local library management API is wired up yet.
    let _ = library_api_lookup(source);

    // 5. Catalog title/author fuzzy search.
    if let Some(query) = build_search_query(source) {
        match fallback.search(&query) {
            Ok(candidates) => {
                if let Some(asin) = best_candidate(&query, &candidates, score_threshold) {
                    return Ok(Some(AsinDiscovery {
                        asin,
                        source: AsinSource::CatalogSearch,
                    }));
                }
            }
            Err(_) => aggregator_unreachable = true,
        }
    }

    // 6. Unvalidated fallback: accept the first format-valid candidate seen
    // above if the aggregator was unreachable for at least one attempt.
    if aggregator_unreachable {
        if let Some(mut discovery) = unvalidated_fallback {
            discovery.source = AsinSource::UnvalidatedFallback;
            return Ok(Some(discovery));
        }
    }

    Ok(None)
}

/// Stubbed external library lookup: no local library management API is
/// integrated, so this always reports not-found.
fn library_api_lookup(_source: &Path) -> Option<String> {
    None
}

fn read_marker_file(source: &Path) -> Option<String> {
    let dir = if source.is_dir() {
        source.to_path_buf()
    } else {
        source.parent()?.to_path_buf()
    };
    std::fs::read_to_string(dir.join(".asin")).ok()
}

fn extract_folder_asin(source: &Path) -> Option<String> {
    let name = source.file_name()?.to_str()?;
    let bracket_re = Regex::new(r"\[([A-Za-z0-9]{10})\]").expect("valid regex");
    let paren_re = Regex::new(r"\(([A-Za-z0-9]{10})\)").expect("valid regex");
    let prefix_re = Regex::new(r"^([A-Za-z0-9]{10})\s*-").expect("valid regex");

    for re in [&bracket_re, &paren_re, &prefix_re] {
        if let Some(caps) = re.captures(name) {
            let candidate = caps[1].to_ascii_uppercase();
            if candidate.starts_with("B0") {
                return Some(candidate);
            }
        }
    }
    None
}

/// Strip a trailing hash suffix (e.g. `" [abc01234]"`, the same shape
/// [`crate::plex_path`] appends as a last-resort title) and series-numbering
/// tokens (`"Book 3"`, `"#3"`, a leading `"03 - "`) from a folder name, so
/// the remainder reads like a plain title or author for search purposes.
fn strip_noise_tokens(name: &str) -> String {
    let hash_re = Regex::new(r"\s*\[[0-9a-fA-F]{6,}\]\s*$").expect("valid regex");
    let series_word_re =
        Regex::new(r"(?i)\b(book|vol\.?|volume|#)\s*\d+(\.\d+)?\b").expect("valid regex");
    let leading_num_re = Regex::new(r"^\s*\d+(\.\d+)?\s*-\s*").expect("valid regex");

    let s = hash_re.replace(name, "");
    let s = series_word_re.replace_all(&s, "");
    let s = leading_num_re.replace(&s, "");
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build a search query from the leaf directory/file name plus its parent
/// directory name, walking up to the grandparent when the parent is
/// identical to the leaf.
fn build_search_query(source: &Path) -> Option<String> {
    let leaf = source.file_name()?.to_str()?;
    let leaf_clean = strip_noise_tokens(leaf);

    let parent_dir = source.parent()?;
    let parent_name = parent_dir.file_name().and_then(|s| s.to_str());
    let effective_parent = match parent_name {
        Some(p) if p != leaf => Some(p.to_string()),
        Some(_) => parent_dir
            .parent()
            .and_then(|grandparent| grandparent.file_name())
            .and_then(|s| s.to_str())
            .map(str::to_string),
        None => None,
    };
    let parent_clean = effective_parent.map(|p| strip_noise_tokens(&p));

    let query = match parent_clean {
        Some(p) if !p.is_empty() => format!("{leaf_clean} {p}"),
        _ => leaf_clean,
    };
    if query.trim().is_empty() {
        None
    } else {
        Some(query)
    }
}

/// Score every candidate's `"title author"` text against `query` with a
/// Jaro-Winkler similarity and return the best ASIN above `threshold`, if
/// any.
fn best_candidate(query: &str, candidates: &[SearchCandidate], threshold: f64) -> Option<String> {
    let query_lower = query.to_ascii_lowercase();
    candidates
        .iter()
        .map(|c| {
            let combined = format!("{} {}", c.title, c.author).to_ascii_lowercase();
            let score = strsim::jaro_winkler(&query_lower, &combined);
            (c.asin.clone(), score)
        })
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(asin, _)| asin)
}
