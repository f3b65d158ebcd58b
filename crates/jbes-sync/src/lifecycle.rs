//! Posting lifecycle state machine: `New -> Active <-> Disappeared`.
//!
//! The tracker is the only writer of `first_seen`, `last_seen`, the
//! disappearance fields and `lifespan_days`. Every operation writes through the
//! store first and only then updates the caller's copy, so a failed write
//! leaves the in-memory posting as it was.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jbes_core::{days_between_ceil, BoardId, Clock, Posting, PostingEvent, PostingEventType, PostingId};
use jbes_storage::{PostingFilter, RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifespanBatch {
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DisappearanceBatch {
    pub marked: usize,
    pub failed: usize,
}

/// Lifespan in whole days, or `None` when the posting has no sighting window yet.
pub fn calculate_lifespan(posting: &Posting) -> Option<i64> {
    let start = posting.first_seen?;
    let end = posting.effective_end()?;
    Some(days_between_ceil(start, end))
}

#[derive(Clone)]
pub struct LifecycleTracker {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl LifecycleTracker {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn emit(
        &self,
        posting_id: PostingId,
        event_type: PostingEventType,
        at: DateTime<Utc>,
        notes: Option<String>,
    ) -> StoreResult<()> {
        self.store
            .append_event(&PostingEvent {
                posting_id,
                event_type,
                event_date: at,
                notes,
            })
            .await
    }

    /// Returns `false` without writing when the first sighting is already recorded.
    pub async fn record_first_sighting(&self, posting: &mut Posting) -> StoreResult<bool> {
        if posting.first_seen.is_some() {
            return Ok(false);
        }
        let now = self.clock.now();
        let mut next = posting.clone();
        next.first_seen = Some(now);
        if next.last_seen.is_none() {
            next.last_seen = Some(now);
        }
        self.store.update_posting_lifecycle(&next).await?;
        self.emit(next.id, PostingEventType::Appeared, now, None).await?;
        debug!(posting_id = next.id, "posting appeared");
        *posting = next;
        Ok(true)
    }

    /// Records a sighting. Returns `true` when the posting came back from `Disappeared`.
    pub async fn update_last_seen(&self, posting: &mut Posting) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut next = posting.clone();
        next.last_seen = Some(now);
        let reappeared = next.disappeared;
        if reappeared {
            next.disappeared = false;
            next.disappeared_at = None;
        }
        self.store.update_posting_lifecycle(&next).await?;
        if reappeared {
            self.emit(
                next.id,
                PostingEventType::Reappeared,
                now,
                Some("Posting seen again after disappearing".to_string()),
            )
            .await?;
            debug!(posting_id = next.id, "posting reappeared");
        }
        *posting = next;
        Ok(reappeared)
    }

    /// Returns `false` without writing when the posting is already disappeared.
    pub async fn mark_as_disappeared(&self, posting: &mut Posting, note: Option<&str>) -> StoreResult<bool> {
        if posting.disappeared {
            return Ok(false);
        }
        let now = self.clock.now();
        let mut next = posting.clone();
        next.disappeared = true;
        next.disappeared_at = Some(now);
        self.store.update_posting_lifecycle(&next).await?;
        self.emit(next.id, PostingEventType::Disappeared, now, note.map(str::to_string))
            .await?;
        debug!(posting_id = next.id, "posting disappeared");
        *posting = next;
        self.calculate_and_update_lifespan(posting).await?;
        Ok(true)
    }

    /// Recomputes and stores the lifespan. Postings without a sighting window
    /// report 0 and are left untouched.
    pub async fn calculate_and_update_lifespan(&self, posting: &mut Posting) -> StoreResult<i64> {
        let Some(days) = calculate_lifespan(posting) else {
            return Ok(0);
        };
        if posting.lifespan_days != Some(days) {
            let mut next = posting.clone();
            next.lifespan_days = Some(days);
            self.store.update_posting_lifecycle(&next).await?;
            *posting = next;
        }
        Ok(days)
    }

    pub async fn bulk_update_all_lifespans(&self) -> StoreResult<LifespanBatch> {
        let postings = self.store.select_postings(&PostingFilter::all()).await?;
        let mut batch = LifespanBatch::default();
        for mut posting in postings {
            if calculate_lifespan(&posting).is_none() {
                batch.skipped += 1;
                continue;
            }
            match self.calculate_and_update_lifespan(&mut posting).await {
                Ok(_) => batch.updated += 1,
                Err(err) => {
                    batch.failed += 1;
                    warn!(posting_id = posting.id, error = %err, "lifespan update failed");
                }
            }
        }
        info!(updated = batch.updated, failed = batch.failed, skipped = batch.skipped, "lifespans recomputed");
        Ok(batch)
    }

    /// Marks every active posting of `board_id` outside `seen` as disappeared.
    pub async fn mark_unseen_as_disappeared(
        &self,
        board_id: BoardId,
        seen: &HashSet<PostingId>,
        note: &str,
    ) -> StoreResult<DisappearanceBatch> {
        let active = self
            .store
            .select_postings(&PostingFilter::for_board(board_id).active())
            .await?;
        let mut batch = DisappearanceBatch::default();
        for mut posting in active.into_iter().filter(|p| !seen.contains(&p.id)) {
            match self.mark_as_disappeared(&mut posting, Some(note)).await {
                Ok(true) => batch.marked += 1,
                Ok(false) => {}
                Err(err) => {
                    batch.failed += 1;
                    warn!(posting_id = posting.id, error = %err, "marking posting disappeared failed");
                }
            }
        }
        Ok(batch)
    }

    pub async fn posting_timeline(&self, posting_id: PostingId) -> StoreResult<Vec<PostingEvent>> {
        let mut events = self.store.posting_events(posting_id).await?;
        events.sort_by_key(|e| e.event_date);
        Ok(events)
    }
}
