//! Fallback aggregator client : used when the primary catalog
//! has no record for an ASIN, or returns a transient failure and the caller
//! chooses to fall through rather than retry. Needs two requests per book —
//! the aggregator keeps chapter data at a separate endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use chapterize_types::{
    Genre, MetadataSource, NormalizedAuthor, NormalizedBook, NormalizedChapter, NormalizedChapters,
    NormalizedNarrator, SeriesPrimary,
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKind, MetadataCache};

pub const SOURCE_NAME: &str = "audnexus";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FallbackAggregatorClient {
    http: reqwest::blocking::Client,
    base_url: String,
    region: String,
    cache: MetadataCache,
}

impl FallbackAggregatorClient {
    pub fn new(base_url: impl Into<String>, region: impl Into<String>, cache: MetadataCache) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("chapterize/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build fallback aggregator HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            region: region.into(),
            cache,
        })
    }

    /// `Ok(None)` means the aggregator has no record of this ASIN. Chapter
    /// data is best-effort: a missing or failing chapters endpoint still
    /// yields a book, just with `chapters: None`, and the duration gate
    /// treats an absent chapter list the same as a catalog that never had
    /// one.
    pub fn fetch_book(&self, asin: &str, force_refresh: bool) -> Result<Option<NormalizedBook>> {
        let book = match self.fetch_raw_book(asin, force_refresh)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let chapters = self.fetch_raw_chapters(asin, force_refresh).unwrap_or(None);
        Ok(Some(normalize(book, chapters)))
    }

    fn fetch_raw_book(&self, asin: &str, force_refresh: bool) -> Result<Option<RawBook>> {
        if let Some(cached) = self
            .cache
            .get::<RawBook>(SOURCE_NAME, CacheKind::Book, asin, force_refresh)?
        {
            return Ok(Some(cached));
        }

        let url = format!("{}/books/{asin}", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("region", self.region.as_str())])
            .send()
            .context("fallback aggregator book request failed")?;

        let status = response.status();
        if status.is_client_error() {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("fallback aggregator returned status {status}");
        }

        let book: RawBook = response
            .json()
            .context("failed to parse fallback aggregator book response")?;
        self.cache.put(SOURCE_NAME, CacheKind::Book, asin, &book)?;
        Ok(Some(book))
    }

    fn fetch_raw_chapters(&self, asin: &str, force_refresh: bool) -> Result<Option<RawChapterInfo>> {
        if let Some(cached) =
            self.cache
                .get::<RawChapterInfo>(SOURCE_NAME, CacheKind::Chapters, asin, force_refresh)?
        {
            return Ok(Some(cached));
        }

        let url = format!("{}/books/{asin}/chapters", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("region", self.region.as_str())])
            .send()
            .context("fallback aggregator chapters request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Ok(None);
        }

        let info: RawChapterInfo = response
            .json()
            .context("failed to parse fallback aggregator chapters response")?;
        self.cache.put(SOURCE_NAME, CacheKind::Chapters, asin, &info)?;
        Ok(Some(info))
    }

    /// Validate that `asin` exists in the aggregator's catalog, for ASIN
    /// discovery (validation step). Reuses the book cache since
    /// this hits the same endpoint as [`fetch_book`](Self::fetch_book).
    pub fn check_asin_exists(&self, asin: &str) -> Result<bool> {
        Ok(self.fetch_raw_book(asin, false)?.is_some())
    }

    /// Title/author search used by ASIN discovery when no other source in
    /// the chain yields a candidate. Not cached: search queries are derived
    /// from folder names and rarely repeat verbatim.
    pub fn search(&self, query: &str) -> Result<Vec<SearchCandidate>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("q", query), ("region", self.region.as_str())])
            .send()
            .context("fallback aggregator search request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("fallback aggregator search returned status {status}");
        }

        let hits: Vec<RawSearchHit> = response
            .json()
            .context("failed to parse fallback aggregator search response")?;
        Ok(hits
            .into_iter()
            .map(|h| SearchCandidate {
                asin: h.asin,
                title: h.title,
                author: h.author_name.unwrap_or_default(),
            })
            .collect())
    }
}

/// One hit from [`FallbackAggregatorClient::search`], before scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCandidate {
    pub asin: String,
    pub title: String,
    pub author: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSearchHit {
    asin: String,
    title: String,
    #[serde(default)]
    author_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBook {
    asin: String,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    authors: Vec<RawPerson>,
    #[serde(default)]
    narrators: Vec<RawPerson>,
    #[serde(default)]
    series: Vec<RawSeries>,
    #[serde(default)]
    genres: Vec<RawGenre>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    runtime_length_min: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPerson {
    name: String,
    #[serde(default)]
    asin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSeries {
    name: String,
    #[serde(default)]
    position: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawGenre {
    name: String,
    #[serde(default)]
    #[serde(rename = "type")]
    genre_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawChapterInfo {
    #[serde(default)]
    is_accurate: bool,
    #[serde(default)]
    runtime_length_ms: u64,
    #[serde(default)]
    brand_intro_duration_ms: Option<u64>,
    #[serde(default)]
    brand_outro_duration_ms: Option<u64>,
    #[serde(default)]
    chapters: Vec<RawChapter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawChapter {
    length_ms: u64,
    start_offset_ms: u64,
    title: String,
}

fn normalize(raw: RawBook, chapters: Option<RawChapterInfo>) -> NormalizedBook {
    let series_primary = raw.series.first().map(|s| SeriesPrimary {
        name: s.name.clone(),
        position: s
            .position
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0),
    });

    let genre_path = raw
        .genres
        .iter()
        .find(|g| g.genre_type.as_deref() == Some("genre"))
        .map(|g| g.name.clone());

    let genres = raw.genres.into_iter().map(|g| Genre { name: g.name }).collect();

    NormalizedBook {
        asin: raw.asin,
        title: raw.title,
        subtitle: raw.subtitle,
        authors: raw
            .authors
            .into_iter()
            .map(|p| NormalizedAuthor { name: p.name, id: p.asin })
            .collect(),
        narrators: raw
            .narrators
            .into_iter()
            .map(|p| NormalizedNarrator { name: p.name })
            .collect(),
        series_primary,
        genres,
        genre_path,
        description: raw.description,
        summary: raw.summary,
        release_date: raw.release_date,
        image: raw.image,
        copyright: None,
        publisher: None,
        isbn: None,
        language: raw.language,
        rating: raw.rating.and_then(|r| r.parse::<f64>().ok()),
        runtime_min: raw.runtime_length_min,
        chapters: chapters.map(|info| NormalizedChapters {
            is_accurate: info.is_accurate,
            runtime_length_ms: info.runtime_length_ms,
            brand_intro_duration_ms: info.brand_intro_duration_ms,
            brand_outro_duration_ms: info.brand_outro_duration_ms,
            chapters: info
                .chapters
                .into_iter()
                .map(|c| NormalizedChapter {
                    length_ms: c.length_ms,
                    start_offset_ms: c.start_offset_ms,
                    title: c.title,
                })
                .collect(),
        }),
        source: MetadataSource::Fallback,
    }
}
