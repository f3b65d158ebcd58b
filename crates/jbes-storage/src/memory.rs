//! Process-local record store backed by a single async mutex.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jbes_core::{
    Board, BoardId, EfficiencyScore, NewPosting, PipelineJob, PipelineRun, Posting,
    PostingEvent, PostingEventType, PostingId, RawDataSnapshot, SurveyRatings, TrendSnapshot,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{LeaseOutcome, PostingFilter, PostingOrder, RecordStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    boards: BTreeMap<BoardId, Board>,
    postings: BTreeMap<PostingId, Posting>,
    next_posting_id: PostingId,
    events: Vec<PostingEvent>,
    surveys: HashMap<BoardId, SurveyRatings>,
    scores: Vec<EfficiencyScore>,
    trend_snapshots: BTreeMap<(BoardId, NaiveDate), TrendSnapshot>,
    raw_snapshots: Vec<RawDataSnapshot>,
    runs: HashMap<Uuid, PipelineRun>,
    jobs: Vec<PipelineJob>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    faults: Faults,
}

#[derive(Debug, Default)]
struct Faults {
    list_boards: bool,
    panic_list_boards: bool,
    stall_list_boards: bool,
    job_writes: bool,
    terminal_run_writes: usize,
    event_writes: bool,
    lifecycle_updates: HashSet<PostingId>,
    cluster_updates: HashSet<PostingId>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_boards(boards: impl IntoIterator<Item = Board>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().await;
            for board in boards {
                state.boards.insert(board.id, board);
            }
        }
        store
    }

    pub async fn add_employer_rating(&self, board_id: BoardId, rating: f64) {
        let mut state = self.state.lock().await;
        state.surveys.entry(board_id).or_default().employer.push(rating);
    }

    pub async fn add_candidate_rating(&self, board_id: BoardId, rating: f64) {
        let mut state = self.state.lock().await;
        state.surveys.entry(board_id).or_default().candidate.push(rating);
    }

    /// Inserts a posting with caller-chosen lifecycle fields. The id is reassigned.
    pub async fn seed_posting(&self, mut posting: Posting) -> Posting {
        let mut state = self.state.lock().await;
        state.next_posting_id += 1;
        posting.id = state.next_posting_id;
        state.postings.insert(posting.id, posting.clone());
        posting
    }

    pub async fn seed_trend_snapshot(&self, snapshot: TrendSnapshot) {
        let mut state = self.state.lock().await;
        state
            .trend_snapshots
            .insert((snapshot.board_id, snapshot.snapshot_date), snapshot);
    }

    pub async fn all_events(&self) -> Vec<PostingEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn all_scores(&self) -> Vec<EfficiencyScore> {
        self.state.lock().await.scores.clone()
    }

    pub async fn fail_board_listing(&self, fail: bool) {
        self.state.lock().await.faults.list_boards = fail;
    }

    pub async fn fail_job_writes(&self, fail: bool) {
        self.state.lock().await.faults.job_writes = fail;
    }

    pub async fn fail_lifecycle_update_for(&self, posting_id: PostingId) {
        self.state
            .lock()
            .await
            .faults
            .lifecycle_updates
            .insert(posting_id);
    }

    pub async fn panic_on_board_listing(&self, panic: bool) {
        self.state.lock().await.faults.panic_list_boards = panic;
    }

    /// Makes `list_boards` wait forever, as a hung connection would.
    pub async fn stall_board_listing(&self, stall: bool) {
        self.state.lock().await.faults.stall_list_boards = stall;
    }

    /// Rejects the next `times` writes of a finished run record.
    pub async fn fail_terminal_run_writes(&self, times: usize) {
        self.state.lock().await.faults.terminal_run_writes = times;
    }

    pub async fn fail_event_writes(&self, fail: bool) {
        self.state.lock().await.faults.event_writes = fail;
    }

    pub async fn fail_repost_cluster_update_for(&self, posting_id: PostingId) {
        self.state
            .lock()
            .await
            .faults
            .cluster_updates
            .insert(posting_id);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults = Faults::default();
    }
}

fn sort_postings(postings: &mut [Posting], order: PostingOrder) {
    match order {
        PostingOrder::IdAsc => postings.sort_by_key(|p| p.id),
        PostingOrder::FirstSeenAsc => postings.sort_by_key(|p| (p.first_seen, p.id)),
        PostingOrder::FirstSeenDesc => {
            postings.sort_by(|a, b| (b.first_seen, b.id).cmp(&(a.first_seen, a.id)))
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_boards(&self) -> StoreResult<Vec<Board>> {
        let state = self.state.lock().await;
        if state.faults.panic_list_boards {
            drop(state);
            panic!("job_boards cursor poisoned");
        }
        if state.faults.stall_list_boards {
            drop(state);
            return std::future::pending().await;
        }
        if state.faults.list_boards {
            return Err(StoreError::Unavailable("job_boards".into()));
        }
        Ok(state.boards.values().cloned().collect())
    }

    async fn get_board(&self, board_id: BoardId) -> StoreResult<Option<Board>> {
        Ok(self.state.lock().await.boards.get(&board_id).cloned())
    }

    async fn upsert_board(&self, board: &Board) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .boards
            .insert(board.id, board.clone());
        Ok(())
    }

    async fn insert_posting(&self, new: &NewPosting) -> StoreResult<Posting> {
        let mut state = self.state.lock().await;
        state.next_posting_id += 1;
        let posting = Posting {
            id: state.next_posting_id,
            board_id: new.board_id,
            title: new.title.clone(),
            company: new.company.clone(),
            url: new.url.clone(),
            normalized_title: new.normalized_title,
            first_seen: None,
            last_seen: None,
            disappeared: false,
            disappeared_at: None,
            lifespan_days: None,
            repost_count: 0,
            repost_cluster_id: None,
        };
        state.postings.insert(posting.id, posting.clone());
        Ok(posting)
    }

    async fn get_posting(&self, posting_id: PostingId) -> StoreResult<Option<Posting>> {
        Ok(self.state.lock().await.postings.get(&posting_id).cloned())
    }

    async fn select_postings(&self, filter: &PostingFilter) -> StoreResult<Vec<Posting>> {
        let state = self.state.lock().await;
        let mut out: Vec<Posting> = state
            .postings
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        sort_postings(&mut out, filter.order);
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn count_postings(&self, filter: &PostingFilter) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.postings.values().filter(|p| filter.matches(p)).count() as i64)
    }

    async fn update_posting_lifecycle(&self, posting: &Posting) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.lifecycle_updates.contains(&posting.id) {
            return Err(StoreError::Unavailable(format!(
                "job_postings row {}",
                posting.id
            )));
        }
        let stored = state
            .postings
            .get_mut(&posting.id)
            .ok_or_else(|| StoreError::not_found("posting", posting.id))?;
        stored.first_seen = posting.first_seen;
        stored.last_seen = posting.last_seen;
        stored.disappeared = posting.disappeared;
        stored.disappeared_at = posting.disappeared_at;
        stored.lifespan_days = posting.lifespan_days;
        Ok(())
    }

    async fn set_repost_count(&self, posting_id: PostingId, repost_count: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .postings
            .get_mut(&posting_id)
            .ok_or_else(|| StoreError::not_found("posting", posting_id))?;
        stored.repost_count = repost_count;
        Ok(())
    }

    async fn set_repost_cluster(
        &self,
        posting_id: PostingId,
        cluster_id: Option<PostingId>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.cluster_updates.contains(&posting_id) {
            return Err(StoreError::Unavailable(format!("job_postings row {posting_id}")));
        }
        let stored = state
            .postings
            .get_mut(&posting_id)
            .ok_or_else(|| StoreError::not_found("posting", posting_id))?;
        stored.repost_cluster_id = cluster_id;
        Ok(())
    }

    async fn append_event(&self, event: &PostingEvent) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.event_writes {
            return Err(StoreError::Unavailable("posting_events".into()));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn posting_events(&self, posting_id: PostingId) -> StoreResult<Vec<PostingEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<PostingEvent> = state
            .events
            .iter()
            .filter(|e| e.posting_id == posting_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_date);
        Ok(events)
    }

    async fn board_events(
        &self,
        board_id: BoardId,
        event_type: Option<PostingEventType>,
    ) -> StoreResult<Vec<PostingEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| event_type.map_or(true, |t| t == e.event_type))
            .filter(|e| {
                state
                    .postings
                    .get(&e.posting_id)
                    .is_some_and(|p| p.board_id == board_id)
            })
            .cloned()
            .collect())
    }

    async fn survey_ratings(&self, board_id: BoardId) -> StoreResult<SurveyRatings> {
        let state = self.state.lock().await;
        Ok(state.surveys.get(&board_id).cloned().unwrap_or_default())
    }

    async fn insert_score(&self, score: &EfficiencyScore) -> StoreResult<()> {
        self.state.lock().await.scores.push(score.clone());
        Ok(())
    }

    async fn latest_scores(&self) -> StoreResult<Vec<EfficiencyScore>> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<BoardId, EfficiencyScore> = BTreeMap::new();
        for score in &state.scores {
            match latest.get(&score.board_id) {
                Some(existing) if existing.computed_at > score.computed_at => {}
                _ => {
                    latest.insert(score.board_id, score.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn board_scores(
        &self,
        board_id: BoardId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EfficiencyScore>> {
        let state = self.state.lock().await;
        let mut scores: Vec<EfficiencyScore> = state
            .scores
            .iter()
            .filter(|s| s.board_id == board_id && s.computed_at >= since)
            .cloned()
            .collect();
        scores.sort_by_key(|s| s.computed_at);
        Ok(scores)
    }

    async fn upsert_trend_snapshot(&self, snapshot: &TrendSnapshot) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .trend_snapshots
            .insert((snapshot.board_id, snapshot.snapshot_date), snapshot.clone());
        Ok(())
    }

    async fn trend_snapshots(
        &self,
        board_id: BoardId,
        since: NaiveDate,
    ) -> StoreResult<Vec<TrendSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .trend_snapshots
            .range((board_id, since)..=(board_id, NaiveDate::MAX))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn insert_raw_snapshot(&self, snapshot: &RawDataSnapshot) -> StoreResult<()> {
        self.state.lock().await.raw_snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn raw_snapshots(&self, board_id: BoardId, limit: usize) -> StoreResult<Vec<RawDataSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .raw_snapshots
            .iter()
            .rev()
            .filter(|s| s.board_id == board_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_run(&self, run: &PipelineRun) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if run.end_time.is_some() && state.faults.terminal_run_writes > 0 {
            state.faults.terminal_run_writes -= 1;
            return Err(StoreError::Unavailable("pipeline_runs".into()));
        }
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<PipelineRun> = state.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<PipelineRun> = state
            .runs
            .values()
            .filter(|r| r.start_time >= since)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }

    async fn upsert_job(&self, job: &PipelineJob) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.job_writes {
            return Err(StoreError::Unavailable("pipeline_jobs".into()));
        }
        match state.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => state.jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn jobs_for_run(&self, run_id: Uuid) -> StoreResult<Vec<PipelineJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let mut state = self.state.lock().await;
        if let Some((current, current_expiry)) = state.leases.get(key) {
            if current != holder && *current_expiry > now {
                return Ok(LeaseOutcome::Held {
                    holder: current.clone(),
                    expires_at: *current_expiry,
                });
            }
        }
        state
            .leases
            .insert(key.to_string(), (holder.to_string(), expires_at));
        Ok(LeaseOutcome::Acquired)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(key).is_some_and(|(h, _)| h == holder) {
            state.leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jbes_core::{BoardCategory, RoleFamily};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, 8, 0, 0).single().unwrap()
    }

    fn board(id: BoardId) -> Board {
        Board {
            id,
            name: format!("board-{id}"),
            category: BoardCategory::Tech,
            url: None,
        }
    }

    fn new_posting(board_id: BoardId, title: &str) -> NewPosting {
        NewPosting {
            board_id,
            title: title.into(),
            company: Some("Acme".into()),
            url: None,
            normalized_title: RoleFamily::SoftwareEngineer,
        }
    }

    #[tokio::test]
    async fn postings_are_filtered_ordered_and_limited() {
        let store = MemoryStore::with_boards([board(1), board(2)]).await;
        for (board_id, title, day) in [(1, "a", 3), (1, "b", 1), (2, "c", 2), (1, "d", 2)] {
            let mut p = store.insert_posting(&new_posting(board_id, title)).await.unwrap();
            p.first_seen = Some(at(day));
            p.last_seen = Some(at(day));
            store.update_posting_lifecycle(&p).await.unwrap();
        }

        let filter = PostingFilter::for_board(1).ordered(PostingOrder::FirstSeenAsc);
        let titles: Vec<String> = store
            .select_postings(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["b", "d", "a"]);

        let newest = store
            .select_postings(&PostingFilter::for_board(1).ordered(PostingOrder::FirstSeenDesc).limit(1))
            .await
            .unwrap();
        assert_eq!(newest[0].title, "a");
        assert_eq!(store.count_postings(&PostingFilter::all()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn trend_snapshots_upsert_per_board_and_day() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        let mut snap = TrendSnapshot {
            board_id: 1,
            snapshot_date: day,
            overall_score: 40.0,
            avg_lifespan_days: Some(20.0),
            avg_repost_rate: Some(3.0),
            avg_employer_score: None,
            avg_candidate_score: None,
            total_postings: 10,
        };
        store.upsert_trend_snapshot(&snap).await.unwrap();
        snap.overall_score = 55.0;
        store.upsert_trend_snapshot(&snap).await.unwrap();
        snap.board_id = 2;
        store.upsert_trend_snapshot(&snap).await.unwrap();

        let rows = store.trend_snapshots(1, day - Duration::days(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].overall_score, 55.0);
    }

    #[tokio::test]
    async fn live_lease_blocks_other_holders_until_expiry() {
        let store = MemoryStore::new();
        let acquired = store
            .try_acquire_lease("pipeline", "run-a", at(1) + Duration::hours(2), at(1))
            .await
            .unwrap();
        assert_eq!(acquired, LeaseOutcome::Acquired);

        let blocked = store
            .try_acquire_lease("pipeline", "run-b", at(1) + Duration::hours(2), at(1) + Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(blocked, LeaseOutcome::Held { ref holder, .. } if holder == "run-a"));

        let taken_over = store
            .try_acquire_lease("pipeline", "run-b", at(1) + Duration::hours(5), at(1) + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(taken_over, LeaseOutcome::Acquired);

        store.release_lease("pipeline", "run-a").await.unwrap();
        let still_held = store
            .try_acquire_lease("pipeline", "run-c", at(2), at(1) + Duration::hours(4))
            .await
            .unwrap();
        assert!(matches!(still_held, LeaseOutcome::Held { .. }));
    }

    #[tokio::test]
    async fn latest_scores_keep_newest_row_per_board() {
        let store = MemoryStore::new();
        for (board_id, overall, day) in [(1, 40, 1), (1, 70, 3), (2, 55, 2)] {
            store
                .insert_score(&EfficiencyScore {
                    board_id,
                    overall_score: overall,
                    lifespan_score: 0.0,
                    repost_score: 0.0,
                    employer_survey_score: 50.0,
                    candidate_survey_score: 50.0,
                    quality_adjustment: 1.0,
                    data_completeness: 0.5,
                    percentile: None,
                    computed_at: at(day),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_scores().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].overall_score, 70);
        assert_eq!(store.all_scores().await.len(), 3);
    }
}
