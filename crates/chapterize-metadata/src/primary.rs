//! Primary catalog client : one region-parameterized GET
//! returns product and chapter data together. Offers fields (subtitle,
//! copyright, publisher, isbn, rating, a higher-resolution cover) the
//! fallback aggregator doesn't.

use std::time::Duration;

use anyhow::{Context, Result};
use chapterize_types::{
    Genre, MetadataSource, NormalizedAuthor, NormalizedBook, NormalizedChapter, NormalizedChapters,
    NormalizedNarrator, SeriesPrimary,
};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKind, MetadataCache};

pub const SOURCE_NAME: &str = "audible";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Highest resolution the primary catalog's image CDN accepts as a
/// size-override query parameter.
pub const MAX_COVER_PX: u32 = 2400;

pub struct PrimaryCatalogClient {
    http: reqwest::blocking::Client,
    base_url: String,
    region: String,
    cache: MetadataCache,
}

impl PrimaryCatalogClient {
    pub fn new(base_url: impl Into<String>, region: impl Into<String>, cache: MetadataCache) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("chapterize/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build primary catalog HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            region: region.into(),
            cache,
        })
    }

    /// Fetch and normalize one book. `Ok(None)` means the catalog does not
    /// have this ASIN (4xx); any other failure is a transient error left to
    /// the caller to treat as non-fatal per the pipeline contract.
    pub fn fetch_book(&self, asin: &str, force_refresh: bool) -> Result<Option<NormalizedBook>> {
        if let Some(cached) = self
            .cache
            .get::<RawProduct>(SOURCE_NAME, CacheKind::Book, asin, force_refresh)?
        {
            return Ok(Some(normalize(cached)));
        }

        let url = format!(
            "{}/1.0/catalog/products/{asin}?response_groups=product_desc,contributors,series,product_extended_attrs,media",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .query(&[("region", self.region.as_str())])
            .send()
            .context("primary catalog request failed")?;

        let status = response.status();
        if status.is_client_error() {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("primary catalog returned status {status}");
        }

        let raw: RawProductEnvelope = response
            .json()
            .context("failed to parse primary catalog response")?;
        let product = raw.product;
        self.cache.put(SOURCE_NAME, CacheKind::Book, asin, &product)?;
        Ok(Some(normalize(product)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawProductEnvelope {
    product: RawProduct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawProduct {
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
    category_ladders: Vec<RawCategoryLadder>,
    #[serde(default)]
    publisher_summary: Option<String>,
    #[serde(default)]
    merchandising_summary: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    product_images: Option<RawImages>,
    #[serde(default)]
    copyright: Option<String>,
    #[serde(default)]
    publisher_name: Option<String>,
    #[serde(default)]
    isbn: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    rating: Option<RawRating>,
    #[serde(default)]
    runtime_length_min: Option<u64>,
    #[serde(default)]
    chapter_info: Option<RawChapterInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPerson {
    name: String,
    #[serde(default)]
    asin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSeries {
    title: String,
    #[serde(default)]
    sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCategoryLadder {
    #[serde(default)]
    ladder: Vec<RawCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCategory {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawImages {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRating {
    #[serde(default)]
    overall_distribution: Option<RawRatingDistribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRatingDistribution {
    #[serde(default)]
    average_rating: Option<f64>,
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

/// Upgrade a catalog image URL to request the highest resolution the CDN
/// will serve, by appending a size-override suffix.
pub fn upgrade_image_resolution(url: &str) -> String {
    format!("{url}._SL{MAX_COVER_PX}_.jpg")
}

fn normalize(raw: RawProduct) -> NormalizedBook {
    let series_primary = raw.series.first().map(|s| SeriesPrimary {
        name: s.title.clone(),
        position: s
            .sequence
            .as_deref()
            .and_then(|seq| seq.parse::<f64>().ok())
            .unwrap_or(0.0),
    });

    let genre_path = raw
        .category_ladders
        .first()
        .map(|ladder| {
            ladder
                .ladder
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(" > ")
        })
        .filter(|s| !s.is_empty());

    let genres = raw
        .category_ladders
        .iter()
        .flat_map(|ladder| ladder.ladder.iter())
        .map(|c| Genre { name: c.name.clone() })
        .collect();

    let image = raw
        .product_images
        .as_ref()
        .and_then(|i| i.image.clone())
        .map(|url| upgrade_image_resolution(&url));

    let chapters = raw.chapter_info.map(|info| NormalizedChapters {
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
    });

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
        description: raw.publisher_summary,
        summary: raw.merchandising_summary,
        release_date: raw.release_date,
        image,
        copyright: raw.copyright,
        publisher: raw.publisher_name,
        isbn: raw.isbn,
        language: raw.language,
        rating: raw
            .rating
            .and_then(|r| r.overall_distribution)
            .and_then(|d| d.average_rating),
        runtime_min: raw.runtime_length_min,
        chapters,
        source: MetadataSource::Primary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    fn sample_envelope() -> serde_json::Value {
        serde_json::json!({
            "product": {
                "asin": "B002V5D1CG",
                "title": "Project Hail Mary",
                "subtitle": "A Novel",
                "authors": [{"name": "Andy Weir", "asin": "B00G0WYW92"}],
                "narrators": [{"name": "Ray Porter"}],
                "series": [],
                "category_ladders": [{"ladder": [{"name": "Science Fiction"}, {"name": "Hard SF"}]}],
                "publisher_summary": "<p>A lone astronaut</p>",
                "release_date": "2021-05-04",
                "product_images": {"image": "https://m.media-amazon.com/images/I/abc.jpg"},
                "copyright": "2021 Andy Weir",
                "publisher_name": "Audible Studios",
                "isbn": "9781655776548",
                "language": "english",
                "rating": {"overall_distribution": {"average_rating": 4.9}},
                "runtime_length_min": 970,
                "chapter_info": {
                    "is_accurate": true,
                    "runtime_length_ms": 58200000,
                    "chapters": [{"length_ms": 60000, "start_offset_ms": 0, "title": "Chapter 1"}]
                }
            }
        })
    }

    #[test]
    fn normalizes_full_payload() {
        let raw: RawProductEnvelope = serde_json::from_value(sample_envelope()).unwrap();
        let book = normalize(raw.product);
        assert_eq!(book.asin, "B002V5D1CG");
        assert_eq!(book.authors[0].name, "Andy Weir");
        assert_eq!(book.genre_path.as_deref(), Some("Science Fiction > Hard SF"));
        assert!(book.image.unwrap().contains("_SL2400_"));
        assert_eq!(book.source, MetadataSource::Primary);
        assert_eq!(book.chapters.unwrap().chapters.len(), 1);
    }

    #[test]
    fn fetch_book_returns_none_on_404() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_string();
        let handle = std::thread::spawn(move || {
            let req = server.recv().unwrap();
            req.respond(Response::from_string("{}").with_status_code(404)).unwrap();
        });

        let td = tempdir().unwrap();
        let client = PrimaryCatalogClient::new(
            format!("http://{addr}"),
            "us",
            MetadataCache::new(td.path(), Duration::from_secs(60)),
        )
        .unwrap();

        let result = client.fetch_book("B0NOTFOUND1", false).unwrap();
        assert!(result.is_none());
        handle.join().unwrap();
    }

    #[test]
    fn fetch_book_caches_successful_response() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_string();
        let handle = std::thread::spawn(move || {
            let req = server.recv().unwrap();
            req.respond(Response::from_string(sample_envelope().to_string())).unwrap();
        });

        let td = tempdir().unwrap();
        let client = PrimaryCatalogClient::new(
            format!("http://{addr}"),
            "us",
            MetadataCache::new(td.path(), Duration::from_secs(60)),
        )
        .unwrap();

        let result = client.fetch_book("B002V5D1CG", false).unwrap();
        assert!(result.is_some());
        handle.join().unwrap();

        assert!(
            client
                .cache
                .path_for(SOURCE_NAME, CacheKind::Book, "B002V5D1CG")
                .exists()
        );
    }
}
