//! Builds the Plex library path for an organized book.
//!
//! Component resolution always prefers catalog metadata, then whatever the
//! embedded M4B tags offer, then a folder-name heuristic, then a final
//! hardcoded fallback — in that priority order for every component
//! independently.

use std::path::{Path, PathBuf};

use chapterize_types::NormalizedBook;

use crate::hash::sanitize_path_component;

/// M4B container tags read directly off the file when no catalog metadata
/// is available (second-priority source).
#[derive(Debug, Clone, Default)]
pub struct EmbeddedTags {
    pub artist: Option<String>,
    pub title: Option<String>,
}

pub struct PlexPathInputs<'a> {
    pub book: Option<&'a NormalizedBook>,
    pub embedded: Option<&'a EmbeddedTags>,
    /// The folder or file stem name, used for path-parser heuristics and as
    /// the last-resort title source.
    pub source_name: &'a str,
    pub book_hash: &'a str,
    pub library_base: &'a Path,
}

/// Build `<base>/<Author>/[<Series>/]<NN - Title (Year)>/<Title>.m4b`.
pub fn build_plex_path(inputs: &PlexPathInputs<'_>) -> PathBuf {
    let author = resolve_author(inputs);
    let (series_name, series_position) = resolve_series(inputs);
    let title = resolve_title(inputs);
    let year = resolve_year(inputs);

    let author = sanitize_path_component(&author);
    let title = sanitize_path_component(&title);

    let folder_label = match series_position {
        Some(pos) => format!("{} - {}", format_series_position(pos), title),
        None => title.clone(),
    };
    let folder_label = match year {
        Some(y) => format!("{folder_label} ({y})"),
        None => folder_label,
    };
    let folder_label = sanitize_path_component(&folder_label);

    let mut path = inputs.library_base.join(&author);
    if let Some(series_name) = series_name {
        path = path.join(sanitize_path_component(&series_name));
    }
    path = path.join(folder_label).join(format!("{title}.m4b"));
    path
}

fn resolve_author(inputs: &PlexPathInputs<'_>) -> String {
    if let Some(book) = inputs.book {
        if let Some(author) = book.authors.first() {
            return author.name.clone();
        }
    }
    if let Some(embedded) = inputs.embedded {
        if let Some(artist) = &embedded.artist {
            if !artist.trim().is_empty() {
                return artist.clone();
            }
        }
    }
    if let Some(author) = heuristic_author(inputs.source_name) {
        return author;
    }
    "Unknown Author".to_string()
}

fn resolve_series(inputs: &PlexPathInputs<'_>) -> (Option<String>, Option<f64>) {
    if let Some(book) = inputs.book {
        if let Some(series) = &book.series_primary {
            return (Some(series.name.clone()), Some(series.position));
        }
    }
    heuristic_series(inputs.source_name)
}

fn resolve_title(inputs: &PlexPathInputs<'_>) -> String {
    if let Some(book) = inputs.book {
        if !book.title.trim().is_empty() {
            return book.title.clone();
        }
    }
    if let Some(embedded) = inputs.embedded {
        if let Some(title) = &embedded.title {
            if !title.trim().is_empty() {
                return title.clone();
            }
        }
    }
    format!("{} [{}]", inputs.source_name, &inputs.book_hash[..8.min(inputs.book_hash.len())])
}

fn resolve_year(inputs: &PlexPathInputs<'_>) -> Option<String> {
    inputs
        .book
        .and_then(|b| b.release_date.as_ref())
        .and_then(|d| d.get(0..4))
        .filter(|y| y.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
}

/// `1.5 -> "01.5"`: zero-pad the integer part to two digits, keep the
/// fractional part verbatim.
fn format_series_position(pos: f64) -> String {
    let rendered = if (pos.fract()).abs() < f64::EPSILON {
        format!("{}", pos.trunc() as i64)
    } else {
        format!("{pos}")
    };
    match rendered.split_once('.') {
        Some((int_part, frac_part)) => format!("{int_part:0>2}.{frac_part}"),
        None => format!("{rendered:0>2}"),
    }
}

/// Folder-name author heuristic: `"Author - Title"` style directories split
/// on the first `" - "`.
fn heuristic_author(source_name: &str) -> Option<String> {
    source_name
        .split_once(" - ")
        .map(|(author, _)| author.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Folder-name series heuristic: `"Series Name NN - Title"` with a trailing
/// numeric token directly before the `" - "` separator taken as the series
/// position.
fn heuristic_series(source_name: &str) -> (Option<String>, Option<f64>) {
    let Some((prefix, _rest)) = source_name.split_once(" - ") else {
        return (None, None);
    };
    let mut tokens: Vec<&str> = prefix.split_whitespace().collect();
    let Some(last) = tokens.last() else {
        return (None, None);
    };
    let Ok(position) = last.parse::<f64>() else {
        return (None, None);
    };
    tokens.pop();
    let series_name = tokens.join(" ");
    if series_name.is_empty() {
        (None, Some(position))
    } else {
        (Some(series_name), Some(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapterize_types::{MetadataSource, NormalizedAuthor, SeriesPrimary};

    fn book_with(author: &str, title: &str, year: &str, series: Option<(&str, f64)>) -> NormalizedBook {
        NormalizedBook {
            asin: "B002V5D1CG".to_string(),
            title: title.to_string(),
            subtitle: None,
            authors: vec![NormalizedAuthor { name: author.to_string(), id: None }],
            narrators: vec![],
            series_primary: series.map(|(name, position)| SeriesPrimary { name: name.to_string(), position }),
            genres: vec![],
            genre_path: None,
            description: None,
            summary: None,
            release_date: Some(format!("{year}-01-01")),
            image: None,
            copyright: None,
            publisher: None,
            isbn: None,
            language: None,
            rating: None,
            runtime_min: None,
            chapters: None,
            source: MetadataSource::Primary,
        }
    }

    #[test]
    fn path_without_series() {
        let book = book_with("Andy Weir", "Project Hail Mary", "2021", None);
        let inputs = PlexPathInputs {
            book: Some(&book),
            embedded: None,
            source_name: "Project Hail Mary",
            book_hash: "abc0123456789def",
            library_base: Path::new("/mnt/library/Audiobooks"),
        };
        let path = build_plex_path(&inputs);
        assert_eq!(
            path,
            Path::new("/mnt/library/Audiobooks/Andy Weir/Project Hail Mary (2021)/Project Hail Mary.m4b")
        );
    }

    #[test]
    fn path_with_series_pads_position() {
        let book = book_with("Brandon Sanderson", "The Way of Kings", "2010", Some(("The Stormlight Archive", 1.0)));
        let inputs = PlexPathInputs {
            book: Some(&book),
            embedded: None,
            source_name: "The Way of Kings",
            book_hash: "abc0123456789def",
            library_base: Path::new("/mnt/library/Audiobooks"),
        };
        let path = build_plex_path(&inputs);
        assert_eq!(
            path,
            Path::new(
                "/mnt/library/Audiobooks/Brandon Sanderson/The Stormlight Archive/01 - The Way of Kings (2010)/The Way of Kings.m4b"
            )
        );
    }

    #[test]
    fn decimal_series_position_is_preserved() {
        assert_eq!(format_series_position(1.5), "01.5");
        assert_eq!(format_series_position(10.0), "10");
        assert_eq!(format_series_position(2.0), "02");
    }

    #[test]
    fn falls_back_to_unknown_author_and_hash_suffixed_title() {
        let inputs = PlexPathInputs {
            book: None,
            embedded: None,
            source_name: "Some Random Folder",
            book_hash: "abc0123456789def",
            library_base: Path::new("/mnt/library/Audiobooks"),
        };
        let path = build_plex_path(&inputs);
        assert!(path.starts_with("/mnt/library/Audiobooks/Unknown Author"));
        assert!(path.to_string_lossy().contains("Some Random Folder [abc01234]"));
    }

    #[test]
    fn heuristic_extracts_author_from_folder_name() {
        let inputs = PlexPathInputs {
            book: None,
            embedded: None,
            source_name: "Andy Weir - Project Hail Mary",
            book_hash: "abc0123456789def",
            library_base: Path::new("/mnt/library/Audiobooks"),
        };
        let path = build_plex_path(&inputs);
        assert!(path.starts_with("/mnt/library/Audiobooks/Andy Weir"));
    }
}
