//! Metadata lookup : a primary catalog client and a fallback
//! aggregator client, both normalizing into [`chapterize_types::NormalizedBook`]
//! so the enrich stage never has to know which one answered.

mod cache;
mod fallback;
mod primary;

pub use cache::{CacheKind, MetadataCache};
pub use fallback::{FallbackAggregatorClient, SOURCE_NAME as FALLBACK_SOURCE_NAME, SearchCandidate};
pub use primary::{MAX_COVER_PX, PrimaryCatalogClient, SOURCE_NAME as PRIMARY_SOURCE_NAME};

use anyhow::Result;
use chapterize_types::NormalizedBook;

/// Common surface both clients implement, so stage code can hold a
/// `&dyn MetadataClient` instead of branching on which catalog is active.
pub trait MetadataClient {
    fn fetch_book(&self, asin: &str, force_refresh: bool) -> Result<Option<NormalizedBook>>;
}

impl MetadataClient for PrimaryCatalogClient {
    fn fetch_book(&self, asin: &str, force_refresh: bool) -> Result<Option<NormalizedBook>> {
        PrimaryCatalogClient::fetch_book(self, asin, force_refresh)
    }
}

impl MetadataClient for FallbackAggregatorClient {
    fn fetch_book(&self, asin: &str, force_refresh: bool) -> Result<Option<NormalizedBook>> {
        FallbackAggregatorClient::fetch_book(self, asin, force_refresh)
    }
}
