pub mod cleaner;
pub mod http_client;
pub mod parsers;
pub mod selectors;

use crate::config::ScraperConfig;
use crate::models::Listing;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use self::http_client::{FetchError, HttpClient};
use self::parsers::ListingParser;
use self::selectors::{LAYOUT_VERSION, SUUMO_SELECTORS};

// ── Source traits ─────────────────────────────────────────────────────────────

/// Raw page transport.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for HttpClient {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.get_text(url).await
    }
}

/// Swappable listing source, as seen by the pipeline.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listings(&self, search_url: &str) -> Result<Vec<Listing>>;
}

// ── SUUMO scraper ─────────────────────────────────────────────────────────────

pub struct SuumoScraper<S = HttpClient> {
    source: S,
    parser: ListingParser,
    max_pages: u32,
    request_delay: Duration,
    jitter_ms: u64,
}

impl SuumoScraper<HttpClient> {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Self::with_source(HttpClient::new(config)?, config)
    }
}

impl<S: PageSource> SuumoScraper<S> {
    pub fn with_source(source: S, config: &ScraperConfig) -> Result<Self> {
        debug!("Using SUUMO selector layout v{}", LAYOUT_VERSION);
        Ok(Self {
            source,
            parser: ListingParser::new(&SUUMO_SELECTORS, &config.base_url)?,
            max_pages: config.max_pages,
            request_delay: Duration::from_millis(config.request_delay_ms),
            jitter_ms: config.jitter_ms,
        })
    }

    /// Follow "next page" links from `start_url`, at most `max_pages` pages.
    ///
    /// A failed fetch ends pagination; whatever was collected before it is
    /// returned.
    pub async fn fetch_all(&self, start_url: &str) -> Vec<Listing> {
        let mut all_listings = Vec::new();
        let mut url = Some(start_url.to_string());
        let mut page = 1u32;

        while let Some(current) = url.take() {
            if page > self.max_pages {
                info!("Reached page limit ({}), stopping", self.max_pages);
                break;
            }

            info!("Fetching page {} ({})", page, current);
            let html = match self.source.fetch_page(&current).await {
                Ok(html) => html,
                Err(e) => {
                    warn!("Page {} failed, keeping {} listings so far: {}", page, all_listings.len(), e);
                    break;
                }
            };

            let parsed = self.parser.parse(&html);
            all_listings.extend(parsed.listings.iter().cloned());
            info!("  Page {}: {} listings (total {})", page, parsed.listings.len(), all_listings.len());

            url = parsed.next_page;
            page += 1;

            if url.is_some() && page <= self.max_pages {
                self.polite_delay().await;
            }
        }

        all_listings
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter = if self.jitter_ms > 0 {
            rand::random_range(0..=self.jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(self.request_delay + Duration::from_millis(jitter)).await;
    }
}

#[async_trait]
impl<S: PageSource> ListingSource for SuumoScraper<S> {
    async fn fetch_listings(&self, search_url: &str) -> Result<Vec<Listing>> {
        let listings = self.fetch_all(search_url).await;
        info!("Total listings scraped: {}", listings.len());
        Ok(listings)
    }
}
