//! Pipeline orchestrator: ties scraper → storage → notifier together.
//!
//! One run:
//!   1. Scrape every results page for the search URL
//!   2. Drop stored listings that are no longer advertised
//!   3. Diff the scrape against the store
//!   4. Notify, save, mark notified (dry run: save only)
//!
//! Exactly one `run_log` row is appended per run, whatever happens in between.

use crate::models::Listing;
use crate::notifier::NotificationSink;
use crate::scraper::ListingSource;
use crate::storage::Repository;
use anyhow::Result;
use tracing::{error, info, warn};

pub struct Pipeline<S, N> {
    source: S,
    notifier: N,
    repo: Repository,
    search_url: String,
    dry_run: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunStats {
    pub listings_found: usize,
    pub expired: usize,
    pub new_listings: usize,
}

impl<S: ListingSource, N: NotificationSink> Pipeline<S, N> {
    pub fn new(source: S, notifier: N, repo: Repository, search_url: impl Into<String>) -> Self {
        Self {
            source,
            notifier,
            repo,
            search_url: search_url.into(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[cfg(test)]
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub async fn run(&self) -> Result<RunStats> {
        info!("Search URL: {}", self.search_url);
        if self.dry_run {
            info!("[DRY RUN] notifications are suppressed");
        }

        let mut stats = RunStats::default();
        let outcome = self.execute(&mut stats).await;

        let error_msg = outcome.as_ref().err().map(|e| format!("{:#}", e));
        if let Some(msg) = &error_msg {
            error!("Run failed: {}", msg);
            if !self.dry_run {
                self.notifier.notify_error(msg).await;
            }
        }

        if let Err(e) = self
            .repo
            .append_run_record(stats.listings_found, stats.new_listings, error_msg.as_deref())
        {
            error!("Could not write run record: {:#}", e);
        }

        outcome.map(|()| stats)
    }

    async fn execute(&self, stats: &mut RunStats) -> Result<()> {
        // ── 1. Scrape ─────────────────────────────────────────────────────────
        let listings = self.source.fetch_listings(&self.search_url).await?;
        stats.listings_found = listings.len();
        info!("Scrape finished: {} listings", listings.len());

        if listings.is_empty() {
            warn!("No listings scraped; the site layout may have changed or this IP is blocked");
        }

        // ── 2. Delisted units ─────────────────────────────────────────────────
        let current_ids: Vec<String> = listings.iter().map(|l| l.listing_id.clone()).collect();
        stats.expired = self.repo.delete_expired(&current_ids)?;
        if stats.expired > 0 {
            info!("Delisted: removed {} listings", stats.expired);
        }

        // ── 3. Diff ───────────────────────────────────────────────────────────
        let fresh = self.repo.filter_new(&listings)?;
        stats.new_listings = fresh.len();
        info!("New listings: {}", fresh.len());

        if fresh.is_empty() {
            return Ok(());
        }

        // ── 4. Deliver + persist ──────────────────────────────────────────────
        if self.dry_run {
            for l in &fresh {
                info!("[DRY RUN]   {}: {} {} {}", l.listing_id, l.building_name, l.rent, l.layout);
            }
            // saved anyway so the next real run does not announce them
            self.repo.save_listings(&fresh)?;
        } else {
            self.notifier.notify(&fresh).await;
            self.repo.save_listings(&fresh)?;
            self.repo.mark_notified(&ids(&fresh))?;
        }

        Ok(())
    }
}

fn ids(listings: &[Listing]) -> Vec<String> {
    listings.iter().map(|l| l.listing_id.clone()).collect()
}
