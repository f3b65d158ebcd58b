//! Scrape-phase persistence: match raw listings to stored postings, insert the
//! new ones and retire postings the board no longer shows.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jbes_core::{Board, Clock, NewPosting, Posting, PostingId, RawListing};
use jbes_storage::{PostingFilter, PostingOrder, RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, warn};

use crate::lifecycle::LifecycleTracker;

pub const DISAPPEARED_NOTE: &str = "Not found in recent scrape";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub scraped: usize,
    pub new: usize,
    pub updated: usize,
    pub reappeared: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub disappeared: usize,
    pub failed: usize,
}

fn identity_key(title: &str, company: Option<&str>) -> (String, String) {
    (
        title.trim().to_lowercase(),
        company.unwrap_or_default().trim().to_lowercase(),
    )
}

pub struct ListingIngestor {
    store: Arc<dyn RecordStore>,
    lifecycle: LifecycleTracker,
    clock: Arc<dyn Clock>,
    reappear_window: Duration,
}

impl ListingIngestor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        lifecycle: LifecycleTracker,
        clock: Arc<dyn Clock>,
        reappear_window_days: i64,
    ) -> Self {
        Self {
            store,
            lifecycle,
            clock,
            reappear_window: Duration::days(reappear_window_days.max(0)),
        }
    }

    fn trackable(&self, posting: &Posting, now: DateTime<Utc>) -> bool {
        !posting.disappeared
            || posting
                .disappeared_at
                .is_some_and(|at| now - at <= self.reappear_window)
    }

    /// Index of the stored posting `listing` refers to. `postings` is newest first.
    fn find_match(&self, postings: &[Posting], listing: &RawListing, now: DateTime<Utc>) -> Option<usize> {
        let url = listing.url.as_deref().map(str::trim).filter(|u| !u.is_empty());
        match url {
            Some(url) => postings
                .iter()
                .position(|p| !p.disappeared && p.canonical_url() == Some(url))
                .or_else(|| {
                    postings
                        .iter()
                        .position(|p| p.canonical_url() == Some(url) && self.trackable(p, now))
                }),
            None => {
                let key = identity_key(&listing.title, listing.company.as_deref());
                postings
                    .iter()
                    .position(|p| !p.disappeared && identity_key(&p.title, p.company.as_deref()) == key)
            }
        }
    }

    pub async fn ingest(&self, board: &Board, listings: Vec<RawListing>) -> StoreResult<IngestSummary> {
        let mut postings = self
            .store
            .select_postings(&PostingFilter::for_board(board.id).ordered(PostingOrder::FirstSeenDesc))
            .await?;
        let now = self.clock.now();
        let mut seen: HashSet<PostingId> = HashSet::new();
        let mut summary = IngestSummary {
            scraped: listings.len(),
            ..IngestSummary::default()
        };

        for listing in listings {
            if listing.title.trim().is_empty() {
                summary.rejected += 1;
                debug!(board_id = board.id, url = ?listing.url, "rejected listing without title");
                continue;
            }

            if let Some(idx) = self.find_match(&postings, &listing, now) {
                let posting = &mut postings[idx];
                if !seen.insert(posting.id) {
                    summary.duplicates += 1;
                    continue;
                }
                // An earlier first-sighting write may have failed after the insert.
                let sighting = if posting.first_seen.is_none() {
                    self.lifecycle.record_first_sighting(posting).await.map(|_| false)
                } else {
                    self.lifecycle.update_last_seen(posting).await
                };
                match sighting {
                    Ok(true) => summary.reappeared += 1,
                    Ok(false) => summary.updated += 1,
                    Err(err) => {
                        summary.failed += 1;
                        warn!(board_id = board.id, posting_id = posting.id, error = %err, "recording sighting failed");
                    }
                }
                continue;
            }

            let mut posting = match self
                .store
                .insert_posting(&NewPosting::from_listing(board.id, &listing))
                .await
            {
                Ok(posting) => posting,
                Err(err) => {
                    summary.failed += 1;
                    warn!(board_id = board.id, title = %listing.title, error = %err, "storing new listing failed");
                    continue;
                }
            };
            seen.insert(posting.id);
            match self.lifecycle.record_first_sighting(&mut posting).await {
                Ok(_) => summary.new += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(board_id = board.id, posting_id = posting.id, error = %err, "recording first sighting failed");
                }
            }
            postings.insert(0, posting);
        }

        if summary.scraped == 0 {
            warn!(board_id = board.id, "scrape returned no listings; keeping active postings");
            return Ok(summary);
        }

        let retired = self
            .lifecycle
            .mark_unseen_as_disappeared(board.id, &seen, DISAPPEARED_NOTE)
            .await?;
        summary.disappeared = retired.marked;
        summary.failed += retired.failed;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jbes_core::{BoardCategory, ManualClock, PostingEventType, PostingStatus, RoleFamily};
    use jbes_storage::MemoryStore;

    fn board() -> Board {
        Board {
            id: 1,
            name: "Stack Jobs".into(),
            category: BoardCategory::Tech,
            url: None,
        }
    }

    fn listing(title: &str, company: Option<&str>, url: Option<&str>) -> RawListing {
        RawListing {
            title: title.into(),
            company: company.map(str::to_string),
            url: url.map(str::to_string),
            location: None,
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, ListingIngestor) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 6, 0, 0).single().unwrap(),
        ));
        let lifecycle = LifecycleTracker::new(store.clone(), clock.clone());
        let ingestor = ListingIngestor::new(store.clone(), lifecycle, clock.clone(), 7);
        (store, clock, ingestor)
    }

    #[tokio::test]
    async fn first_scrape_creates_postings_with_role_families() {
        let (store, _clock, ingestor) = setup();
        let summary = ingestor
            .ingest(
                &board(),
                vec![
                    listing("Senior Backend Developer", Some("Acme"), Some("https://jobs.example/1")),
                    listing("Product Manager", Some("Bolt"), None),
                    listing("   ", Some("Nobody"), None),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.new, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.disappeared, 0);

        let postings = store.select_postings(&PostingFilter::for_board(1)).await.unwrap();
        assert_eq!(postings.len(), 2);
        assert!(postings.iter().all(|p| p.status() == PostingStatus::Active));
        assert_eq!(postings[0].normalized_title, RoleFamily::SoftwareEngineer);
        assert_eq!(postings[1].normalized_title, RoleFamily::ProductManager);
    }

    #[tokio::test]
    async fn rescrape_updates_matches_and_retires_missing_postings() {
        let (store, clock, ingestor) = setup();
        ingestor
            .ingest(
                &board(),
                vec![
                    listing("Backend Developer", Some("Acme"), Some("https://jobs.example/1")),
                    listing("QA Engineer", Some("Acme"), None),
                ],
            )
            .await
            .unwrap();

        clock.advance(Duration::days(1));
        let summary = ingestor
            .ingest(
                &board(),
                vec![
                    listing("Backend Developer (Remote)", Some("Acme"), Some("https://jobs.example/1")),
                    listing("Backend Developer (Remote)", Some("Acme"), Some("https://jobs.example/1")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.new, 0);
        assert_eq!(summary.disappeared, 1);

        let retired = store
            .select_postings(&PostingFilter::for_board(1).disappeared())
            .await
            .unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].title, "QA Engineer");
        assert_eq!(retired[0].lifespan_days, Some(1));
    }

    #[tokio::test]
    async fn url_reappearing_within_window_revives_the_posting() {
        let (store, clock, ingestor) = setup();
        let url = Some("https://jobs.example/9");
        ingestor
            .ingest(&board(), vec![listing("Data Engineer", Some("Acme"), url)])
            .await
            .unwrap();
        clock.advance(Duration::days(1));
        ingestor
            .ingest(&board(), vec![listing("Designer", Some("Acme"), None)])
            .await
            .unwrap();

        clock.advance(Duration::days(3));
        let summary = ingestor
            .ingest(&board(), vec![listing("Data Engineer", Some("Acme"), url)])
            .await
            .unwrap();
        assert_eq!(summary.reappeared, 1);
        assert_eq!(summary.new, 0);

        let events = store.all_events().await;
        assert!(events.iter().any(|e| e.event_type == PostingEventType::Reappeared));
    }

    #[tokio::test]
    async fn url_returning_after_window_is_a_new_posting() {
        let (store, clock, ingestor) = setup();
        let url = Some("https://jobs.example/9");
        ingestor
            .ingest(&board(), vec![listing("Data Engineer", Some("Acme"), url)])
            .await
            .unwrap();
        clock.advance(Duration::days(1));
        ingestor
            .ingest(&board(), vec![listing("Designer", Some("Acme"), None)])
            .await
            .unwrap();

        clock.advance(Duration::days(10));
        let summary = ingestor
            .ingest(&board(), vec![listing("Data Engineer", Some("Acme"), url)])
            .await
            .unwrap();
        assert_eq!(summary.new, 1);
        let same_url = store
            .select_postings(&PostingFilter::for_board(1).with_url("https://jobs.example/9"))
            .await
            .unwrap();
        assert_eq!(same_url.len(), 2);
    }

    #[tokio::test]
    async fn failed_sighting_is_counted_and_the_rest_are_ingested() {
        let (store, clock, ingestor) = setup();
        ingestor
            .ingest(
                &board(),
                vec![
                    listing("Backend Developer", Some("Acme"), Some("https://jobs.example/1")),
                    listing("QA Engineer", Some("Acme"), Some("https://jobs.example/2")),
                    listing("Designer", Some("Acme"), Some("https://jobs.example/3")),
                ],
            )
            .await
            .unwrap();
        let stuck = store
            .select_postings(&PostingFilter::for_board(1).with_url("https://jobs.example/1"))
            .await
            .unwrap()
            .remove(0);
        store.fail_lifecycle_update_for(stuck.id).await;

        clock.advance(Duration::days(1));
        let summary = ingestor
            .ingest(
                &board(),
                vec![
                    listing("Backend Developer", Some("Acme"), Some("https://jobs.example/1")),
                    listing("QA Engineer", Some("Acme"), Some("https://jobs.example/2")),
                    listing("Data Engineer", Some("Acme"), Some("https://jobs.example/4")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.new, 1);
        assert_eq!(summary.disappeared, 1);

        let retired = store
            .select_postings(&PostingFilter::for_board(1).disappeared())
            .await
            .unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].title, "Designer");
        let stuck = store.get_posting(stuck.id).await.unwrap().unwrap();
        assert!(!stuck.disappeared);
    }

    #[tokio::test]
    async fn empty_scrape_keeps_active_postings() {
        let (store, clock, ingestor) = setup();
        ingestor
            .ingest(&board(), vec![listing("Data Engineer", Some("Acme"), None)])
            .await
            .unwrap();
        clock.advance(Duration::days(1));
        let summary = ingestor.ingest(&board(), Vec::new()).await.unwrap();
        assert_eq!(summary.disappeared, 0);
        assert_eq!(
            store
                .count_postings(&PostingFilter::for_board(1).active())
                .await
                .unwrap(),
            1
        );
    }
}
