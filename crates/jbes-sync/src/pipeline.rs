//! Five-phase batch run: scrape, snapshot, lifespan update, repost detection
//! and scoring. Per-board work is isolated so one board's failure is recorded
//! on its job and never stops the others.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use jbes_adapters::ScraperRegistry;
use jbes_core::{
    Board, BoardId, Clock, EfficiencyScore, JobStatus, JobType, PipelineJob, PipelineRun, RawDataSnapshot, RunStatus,
    SystemClock,
};
use jbes_storage::{
    HttpFetcher, LeaseOutcome, PgStore, PostingFilter, PostingOrder, RecordStore, StoreResult,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregates::Aggregator;
use crate::config::{BoardsFile, SyncConfig};
use crate::ingest::{IngestSummary, ListingIngestor};
use crate::lifecycle::LifecycleTracker;
use crate::reports;
use crate::reposts::{RepostConfig, RepostDetector};
use crate::scoring::{assign_percentiles, rank_scores, BoardScore, EfficiencyScorer, RankedScore};
use crate::stats::round_to;
use crate::trends::TrendDetector;
use crate::PipelineError;

pub const LEASE_KEY: &str = "pipeline";

const FINAL_WRITE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrent_boards: usize,
    pub job_timeout: Duration,
    /// Upper bound for each store call made by the orchestrator itself.
    pub store_timeout: Duration,
    pub lease_ttl: chrono::Duration,
    pub min_repost_gap_days: i64,
    pub reappear_window_days: i64,
    pub snapshot_sample_limit: usize,
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_boards: 4,
            job_timeout: Duration::from_secs(120),
            store_timeout: Duration::from_secs(30),
            lease_ttl: chrono::Duration::hours(2),
            min_repost_gap_days: 1,
            reappear_window_days: 7,
            snapshot_sample_limit: 50,
            reports_dir: None,
        }
    }
}

impl From<&SyncConfig> for PipelineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_concurrent_boards: config.max_concurrent_boards.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            store_timeout: Duration::from_secs(config.store_timeout_secs.max(1)),
            lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs),
            min_repost_gap_days: config.min_repost_gap_days,
            reappear_window_days: config.reappear_window_days,
            snapshot_sample_limit: config.snapshot_sample_limit,
            reports_dir: config.reports_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: PipelineRun,
    pub jobs: Vec<PipelineJob>,
    pub scores: Vec<RankedScore>,
    pub board_names: BTreeMap<BoardId, String>,
    pub reports_dir: Option<PathBuf>,
}

impl RunSummary {
    pub fn board_name(&self, board_id: BoardId) -> &str {
        self.board_names
            .get(&board_id)
            .map(String::as_str)
            .unwrap_or("unknown board")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub days: i64,
    pub total_runs: usize,
    pub completed_runs: usize,
    pub partial_runs: usize,
    pub failed_runs: usize,
    pub running_runs: usize,
    pub total_jobs: i64,
    pub failed_jobs: i64,
    pub job_success_rate: Option<f64>,
    pub avg_duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotCounts {
    pub posting_count: i64,
    pub new_postings: i64,
    pub active_postings: i64,
    pub disappeared_postings: i64,
    pub repost_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum ScoreOutcome {
    Scored(BoardScore),
    Skipped { reason: String },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn phase_label(job_type: JobType) -> &'static str {
    match job_type {
        JobType::Scrape => "Scrape",
        JobType::Snapshot => "Snapshot",
        JobType::Lifespan => "Lifespan update",
        JobType::Repost => "Repost detection",
        JobType::Score => "Scoring",
    }
}

/// In-flight bookkeeping for one run.
struct RunState {
    run: PipelineRun,
    jobs: Vec<PipelineJob>,
    board_names: BTreeMap<BoardId, String>,
    fatal: bool,
}

impl RunState {
    fn new(run_id: Uuid, start_time: DateTime<Utc>) -> Self {
        Self {
            run: PipelineRun {
                run_id,
                status: RunStatus::Running,
                start_time,
                end_time: None,
                total_jobs: 0,
                completed_jobs: 0,
                failed_jobs: 0,
                errors: Vec::new(),
            },
            jobs: Vec::new(),
            board_names: BTreeMap::new(),
            fatal: false,
        }
    }

    fn failure_message(&self, job: &PipelineJob) -> String {
        let label = phase_label(job.job_type);
        let reason = job.error.as_deref().unwrap_or("unknown error");
        match job.board_id {
            Some(board_id) => {
                let name = self
                    .board_names
                    .get(&board_id)
                    .cloned()
                    .unwrap_or_else(|| format!("board {board_id}"));
                format!("{label} failed for {name}: {reason}")
            }
            None => format!("{label} failed: {reason}"),
        }
    }

    fn record(&mut self, jobs: impl IntoIterator<Item = PipelineJob>) {
        for job in jobs {
            if job.status == JobStatus::Failed {
                let message = self.failure_message(&job);
                self.run.errors.push(message);
            }
            self.jobs.push(job);
        }
        self.tally();
    }

    fn tally(&mut self) {
        self.run.total_jobs = self.jobs.len() as i64;
        self.run.completed_jobs = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count() as i64;
        self.run.failed_jobs = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count() as i64;
    }

    /// Fails every job that has not finished and records the fatal error.
    fn abort(&mut self, err: &PipelineError, at: DateTime<Utc>) -> Vec<PipelineJob> {
        let mut aborted = Vec::new();
        for job in self.jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
            job.status = JobStatus::Failed;
            job.error = Some("run aborted".to_string());
            job.completed_at = Some(at);
            aborted.push(job.clone());
        }
        self.run.errors.push(format!("Fatal error: {err}"));
        self.fatal = true;
        self.tally();
        aborted
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.tally();
        self.run.end_time = Some(at);
        self.run.status = if self.fatal {
            RunStatus::Failed
        } else {
            RunStatus::from_counts(self.run.total_jobs as usize, self.run.failed_jobs as usize)
        };
    }
}

pub struct PipelineOrchestrator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    scrapers: ScraperRegistry,
    settings: PipelineSettings,
    lifecycle: LifecycleTracker,
    ingestor: ListingIngestor,
    reposts: RepostDetector,
    scorer: EfficiencyScorer,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        scrapers: ScraperRegistry,
        settings: PipelineSettings,
    ) -> Self {
        let lifecycle = LifecycleTracker::new(Arc::clone(&store), Arc::clone(&clock));
        let ingestor = ListingIngestor::new(
            Arc::clone(&store),
            lifecycle.clone(),
            Arc::clone(&clock),
            settings.reappear_window_days,
        );
        let reposts = RepostDetector::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            RepostConfig {
                min_gap_days: settings.min_repost_gap_days,
                ..RepostConfig::default()
            },
        );
        let scorer = EfficiencyScorer::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            scrapers,
            settings,
            lifecycle,
            ingestor,
            reposts,
            scorer,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> &LifecycleTracker {
        &self.lifecycle
    }

    pub fn reposts(&self) -> &RepostDetector {
        &self.reposts
    }

    pub fn scorer(&self) -> &EfficiencyScorer {
        &self.scorer
    }

    pub fn trends(&self) -> TrendDetector {
        TrendDetector::new(Arc::clone(&self.store), Arc::clone(&self.clock))
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(Arc::clone(&self.store), Arc::clone(&self.clock))
    }

    /// Runs all five phases under the run lease.
    ///
    /// The run record always ends terminal. A panic anywhere in the run is
    /// caught, the run and its open jobs are written as failed and the lease
    /// is released before the panic is returned as `PipelineError::Panicked`.
    pub async fn run_pipeline(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let holder = run_id.to_string();
        let started = self.clock.now();
        let lease = self
            .bounded(
                "acquiring pipeline lease",
                self.store
                    .try_acquire_lease(LEASE_KEY, &holder, started + self.settings.lease_ttl, started),
            )
            .await?;
        if let LeaseOutcome::Held { holder, expires_at } = lease {
            return Err(PipelineError::AlreadyRunning { holder, expires_at });
        }

        let outcome = AssertUnwindSafe(
            self.execute(run_id, started)
                .instrument(info_span!("pipeline_run", %run_id)),
        )
        .catch_unwind()
        .await;
        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let err = PipelineError::Panicked {
                    what: "pipeline run".to_string(),
                    message: panic_message(payload.as_ref()),
                };
                error!(%run_id, error = %err, "pipeline run crashed");
                self.record_crashed_run(run_id, started, &err).await;
                Err(err)
            }
        };
        if let Err(err) = self
            .bounded("releasing pipeline lease", self.store.release_lease(LEASE_KEY, &holder))
            .await
        {
            warn!(%run_id, error = %err, "releasing pipeline lease failed");
        }
        outcome
    }

    async fn execute(&self, run_id: Uuid, started: DateTime<Utc>) -> Result<RunSummary, PipelineError> {
        let mut state = RunState::new(run_id, started);
        self.bounded("writing run record", self.store.upsert_run(&state.run))
            .await
            .map_err(|e| PipelineError::Fatal(format!("creating run record: {e}")))?;
        info!("pipeline run started");

        let mut scores = Vec::new();
        if let Err(err) = self.run_phases(&mut state, &mut scores).await {
            error!(error = %err, "pipeline run aborted");
            let aborted = state.abort(&err, self.clock.now());
            for job in &aborted {
                self.persist_job(job).await;
            }
        }

        state.finish(self.clock.now());
        self.write_final_run(&mut state).await;
        info!(
            status = %state.run.status,
            total_jobs = state.run.total_jobs,
            failed_jobs = state.run.failed_jobs,
            "pipeline run finished"
        );

        let mut summary = RunSummary {
            run: state.run,
            jobs: state.jobs,
            scores: rank_scores(scores),
            board_names: state.board_names,
            reports_dir: None,
        };
        if let Some(root) = &self.settings.reports_dir {
            match reports::write_run_reports(root, &summary).await {
                Ok(dir) => summary.reports_dir = Some(dir),
                Err(err) => warn!(error = %err, "writing run reports failed"),
            }
        }
        Ok(summary)
    }

    /// Rebuilds a crashed run from what was checkpointed and writes it as failed.
    async fn record_crashed_run(&self, run_id: Uuid, started: DateTime<Utc>, err: &PipelineError) {
        let mut state = RunState::new(run_id, started);
        match self.bounded("reading run record", self.store.get_run(run_id)).await {
            Ok(Some(run)) => state.run = run,
            Ok(None) => {}
            Err(read_err) => warn!(%run_id, error = %read_err, "loading crashed run failed"),
        }
        match self.bounded("reading run jobs", self.store.jobs_for_run(run_id)).await {
            Ok(jobs) => state.jobs = jobs,
            Err(read_err) => warn!(%run_id, error = %read_err, "loading crashed run jobs failed"),
        }
        let now = self.clock.now();
        for job in &state.abort(err, now) {
            self.persist_job(job).await;
        }
        state.finish(now);
        self.write_final_run(&mut state).await;
    }

    /// Writes the terminal run record, retrying once. If both attempts fail the
    /// returned run is marked failed so callers do not mistake it for a clean one.
    async fn write_final_run(&self, state: &mut RunState) {
        let mut attempt = 1;
        loop {
            match self
                .bounded("writing run record", self.store.upsert_run(&state.run))
                .await
            {
                Ok(()) => return,
                Err(err) if attempt < FINAL_WRITE_ATTEMPTS => {
                    warn!(attempt, error = %err, "recording run result failed, retrying");
                    attempt += 1;
                }
                Err(err) => {
                    error!(attempt, error = %err, "run result could not be recorded");
                    state.run.errors.push(format!("Fatal error: recording run result: {err}"));
                    state.run.status = RunStatus::Failed;
                    return;
                }
            }
        }
    }

    async fn run_phases(
        &self,
        state: &mut RunState,
        scores: &mut Vec<EfficiencyScore>,
    ) -> Result<(), PipelineError> {
        let run_id = state.run.run_id;
        let run_started = state.run.start_time;
        let boards = self
            .bounded("reading boards", self.store.list_boards())
            .await
            .map_err(|e| PipelineError::Fatal(format!("listing boards: {e}")))?;
        state.board_names = boards.iter().map(|b| (b.id, b.name.clone())).collect();

        let work = boards.iter().map(|b| (b.id, self.scrape_board(b).boxed())).collect();
        let scraped = self.run_board_phase(run_id, JobType::Scrape, work).await;
        state.record(scraped.into_iter().map(|(job, _)| job));
        self.checkpoint(state).await;

        let work = boards
            .iter()
            .map(|b| (b.id, self.snapshot_board(b, run_started).boxed()))
            .collect();
        let snapshots = self.run_board_phase(run_id, JobType::Snapshot, work).await;
        state.record(snapshots.into_iter().map(|(job, _)| job));
        self.checkpoint(state).await;

        info!(phase = %JobType::Lifespan, "pipeline phase started");
        let (lifespan_job, _) = self
            .run_job(run_id, JobType::Lifespan, None, async {
                Ok::<_, PipelineError>(self.lifecycle.bulk_update_all_lifespans().await?)
            })
            .await;
        state.record([lifespan_job]);
        self.checkpoint(state).await;

        let work = boards
            .iter()
            .map(|b| {
                let detect = async move { Ok::<_, PipelineError>(self.reposts.bulk_detect_for_board(b.id).await?) };
                (b.id, detect.boxed())
            })
            .collect();
        let reposts = self.run_board_phase(run_id, JobType::Repost, work).await;
        state.record(reposts.into_iter().map(|(job, _)| job));
        self.checkpoint(state).await;

        let work = boards.iter().map(|b| (b.id, self.score_board(b).boxed())).collect();
        let scored = self.run_board_phase(run_id, JobType::Score, work).await;
        let mut jobs = Vec::with_capacity(scored.len());
        let mut computed = Vec::new();
        for (job, outcome) in scored {
            if let Some(ScoreOutcome::Scored(board_score)) = outcome {
                computed.push((jobs.len(), board_score));
            }
            jobs.push(job);
        }
        self.persist_scores(&mut jobs, computed, scores).await;
        state.record(jobs);
        Ok(())
    }

    /// Ranks this run's scores, then appends score rows and upserts the day's
    /// trend snapshots. A failed write fails that board's score job.
    async fn persist_scores(
        &self,
        jobs: &mut [PipelineJob],
        mut computed: Vec<(usize, BoardScore)>,
        scores: &mut Vec<EfficiencyScore>,
    ) {
        let mut rows: Vec<_> = computed.iter().map(|(_, s)| s.score.clone()).collect();
        assign_percentiles(&mut rows);
        for ((_, board_score), row) in computed.iter_mut().zip(rows) {
            board_score.score = row;
        }

        for (idx, board_score) in computed {
            let job = &mut jobs[idx];
            let written = match self
                .bounded("writing score", self.store.insert_score(&board_score.score))
                .await
            {
                Ok(()) => {
                    self.bounded(
                        "writing trend snapshot",
                        self.store.upsert_trend_snapshot(&board_score.trend_snapshot()),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match written {
                Ok(()) => {
                    job.result = serde_json::to_value(ScoreOutcome::Scored(board_score.clone())).ok();
                    scores.push(board_score.score);
                }
                Err(err) => {
                    warn!(board_id = board_score.score.board_id, error = %err, "persisting score failed");
                    job.status = JobStatus::Failed;
                    job.error = Some(format!("persisting score: {err}"));
                }
            }
            self.persist_job(job).await;
        }
    }

    /// Runs one job per board, at most `max_concurrent_boards` at a time, and
    /// returns them ordered by board id.
    async fn run_board_phase<'a, T>(
        &'a self,
        run_id: Uuid,
        job_type: JobType,
        work: Vec<(BoardId, BoxFuture<'a, Result<T, PipelineError>>)>,
    ) -> Vec<(PipelineJob, Option<T>)>
    where
        T: Serialize + Send + 'a,
    {
        info!(phase = %job_type, boards = work.len(), "pipeline phase started");
        let jobs: Vec<_> = work
            .into_iter()
            .map(|(board_id, job)| {
                self.run_job(run_id, job_type, Some(board_id), job)
                    .instrument(info_span!("board_job", job_type = %job_type, board_id))
            })
            .collect();
        let mut results: Vec<(PipelineJob, Option<T>)> = stream::iter(jobs)
            .buffer_unordered(self.settings.max_concurrent_boards.max(1))
            .collect()
            .await;
        results.sort_by_key(|(job, _)| job.board_id);
        results
    }

    /// Drives one job through pending, running and a terminal state, bounded by
    /// the job timeout. A panic inside `work` fails only this job.
    async fn run_job<T, Fut>(
        &self,
        run_id: Uuid,
        job_type: JobType,
        board_id: Option<BoardId>,
        work: Fut,
    ) -> (PipelineJob, Option<T>)
    where
        T: Serialize,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut job = PipelineJob::pending(run_id, job_type, board_id);
        self.persist_job(&job).await;
        job.status = JobStatus::Running;
        job.started_at = Some(self.clock.now());
        self.persist_job(&job).await;

        let guarded = AssertUnwindSafe(work).catch_unwind();
        let outcome = match tokio::time::timeout(self.settings.job_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(PipelineError::Panicked {
                what: format!("{job_type} job"),
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => Err(PipelineError::Timeout {
                what: format!("{job_type} job"),
                after: self.settings.job_timeout,
            }),
        };
        job.completed_at = Some(self.clock.now());
        let value = match outcome {
            Ok(value) => {
                job.status = JobStatus::Completed;
                match serde_json::to_value(&value) {
                    Ok(result) => job.result = Some(result),
                    Err(err) => warn!(job_id = %job.id, error = %err, "job result not serializable"),
                }
                Some(value)
            }
            Err(err) => {
                warn!(job_type = %job_type, board_id = ?board_id, error = %err, "pipeline job failed");
                job.status = JobStatus::Failed;
                job.error = Some(err.to_string());
                None
            }
        };
        self.persist_job(&job).await;
        (job, value)
    }

    /// Awaits a store call made by the orchestrator, giving up after `store_timeout`.
    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PipelineError::Timeout {
                what: what.to_string(),
                after: self.settings.store_timeout,
            }),
        }
    }

    async fn persist_job(&self, job: &PipelineJob) {
        if let Err(err) = self.bounded("writing job record", self.store.upsert_job(job)).await {
            warn!(job_id = %job.id, status = %job.status, error = %err, "recording job state failed");
        }
    }

    async fn checkpoint(&self, state: &RunState) {
        if let Err(err) = self.bounded("writing run record", self.store.upsert_run(&state.run)).await {
            warn!(error = %err, "recording run progress failed");
        }
    }

    async fn scrape_board(&self, board: &Board) -> Result<IngestSummary, PipelineError> {
        let scraper = self
            .scrapers
            .scraper_for(board.id)
            .ok_or(PipelineError::NoScraper { board_id: board.id })?;
        let listings = scraper.scrape(board).await?;
        info!(board_id = board.id, scraper = scraper.kind(), listings = listings.len(), "board scraped");
        Ok(self.ingestor.ingest(board, listings).await?)
    }

    async fn snapshot_board(&self, board: &Board, run_started: DateTime<Utc>) -> Result<SnapshotCounts, PipelineError> {
        let postings = self
            .store
            .select_postings(&PostingFilter::for_board(board.id).ordered(PostingOrder::FirstSeenDesc))
            .await?;
        let disappeared = postings.iter().filter(|p| p.disappeared).count() as i64;
        let counts = SnapshotCounts {
            posting_count: postings.len() as i64,
            new_postings: postings
                .iter()
                .filter(|p| p.first_seen.is_some_and(|seen| seen >= run_started))
                .count() as i64,
            active_postings: postings.len() as i64 - disappeared,
            disappeared_postings: disappeared,
            repost_count: postings.iter().map(|p| p.repost_count).sum(),
        };
        let sample: Vec<serde_json::Value> = postings
            .iter()
            .take(self.settings.snapshot_sample_limit)
            .map(|p| {
                json!({
                    "id": p.id,
                    "title": p.title,
                    "company": p.company,
                    "url": p.url,
                    "role_family": p.normalized_title,
                })
            })
            .collect();
        let snapshot = RawDataSnapshot {
            board_id: board.id,
            snapshot_date: self.clock.today(),
            posting_count: counts.posting_count,
            new_postings: counts.new_postings,
            active_postings: counts.active_postings,
            disappeared_postings: counts.disappeared_postings,
            repost_count: counts.repost_count,
            data: json!({ "postings": sample, "stats": counts }),
        };
        self.store.insert_raw_snapshot(&snapshot).await?;
        Ok(counts)
    }

    async fn score_board(&self, board: &Board) -> Result<ScoreOutcome, PipelineError> {
        Ok(match self.scorer.compute_board_score(board.id).await? {
            Some(score) => ScoreOutcome::Scored(score),
            None => {
                info!(board_id = board.id, "score skipped: insufficient lifespan or repost data");
                ScoreOutcome::Skipped {
                    reason: "insufficient lifespan or repost data".to_string(),
                }
            }
        })
    }

    pub async fn latest_ranked_scores(&self) -> StoreResult<Vec<RankedScore>> {
        self.scorer.latest_ranked_scores().await
    }

    pub async fn run_history(&self, limit: usize) -> StoreResult<Vec<PipelineRun>> {
        self.store.list_runs(limit).await
    }

    pub async fn pipeline_stats(&self, days: i64) -> StoreResult<PipelineStats> {
        let since = self.clock.now() - chrono::Duration::days(days);
        let runs = self.store.runs_since(since).await?;
        Ok(summarize_runs(days, &runs))
    }
}

pub fn summarize_runs(days: i64, runs: &[PipelineRun]) -> PipelineStats {
    let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
    let total_jobs: i64 = runs.iter().map(|r| r.total_jobs).sum();
    let failed_jobs: i64 = runs.iter().map(|r| r.failed_jobs).sum();
    let completed_jobs: i64 = runs.iter().map(|r| r.completed_jobs).sum();
    let durations: Vec<f64> = runs
        .iter()
        .filter_map(|r| r.end_time.map(|end| (end - r.start_time).num_milliseconds() as f64 / 1000.0))
        .collect();
    PipelineStats {
        days,
        total_runs: runs.len(),
        completed_runs: count(RunStatus::Completed),
        partial_runs: count(RunStatus::Partial),
        failed_runs: count(RunStatus::Failed),
        running_runs: count(RunStatus::Running),
        total_jobs,
        failed_jobs,
        job_success_rate: (total_jobs > 0)
            .then(|| round_to(completed_jobs as f64 / total_jobs as f64 * 100.0, 1)),
        avg_duration_secs: crate::stats::mean(&durations).map(|d| round_to(d, 1)),
    }
}

/// Orchestrator over `store` with scrapers from the configured boards file.
pub async fn build_orchestrator(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
) -> anyhow::Result<PipelineOrchestrator> {
    let boards = BoardsFile::load(&config.boards_file).await?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let base_dir = config
        .boards_file
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.workspace_root.clone());
    let scrapers = boards.build_registry(&http, &base_dir)?;
    info!(scrapers = scrapers.len(), "board scrapers registered");
    Ok(PipelineOrchestrator::new(
        store,
        Arc::new(SystemClock),
        scrapers,
        PipelineSettings::from(config),
    ))
}

pub async fn run_pipeline_from_env() -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env();
    let store = PgStore::connect(&config.database_url, 5)
        .await
        .context("connecting to database")?;
    let orchestrator = build_orchestrator(&config, Arc::new(store)).await?;
    Ok(orchestrator.run_pipeline().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use jbes_adapters::{BoardScraper, ScrapeError};
    use jbes_core::{BoardCategory, ManualClock, RawListing};
    use jbes_storage::MemoryStore;

    struct StaticScraper(Vec<RawListing>);

    #[async_trait]
    impl BoardScraper for StaticScraper {
        fn kind(&self) -> &'static str {
            "static"
        }

        async fn scrape(&self, _board: &Board) -> Result<Vec<RawListing>, ScrapeError> {
            Ok(self.0.clone())
        }
    }

    struct StalledScraper;

    #[async_trait]
    impl BoardScraper for StalledScraper {
        fn kind(&self) -> &'static str {
            "stalled"
        }

        async fn scrape(&self, _board: &Board) -> Result<Vec<RawListing>, ScrapeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    struct PanickingScraper;

    #[async_trait]
    impl BoardScraper for PanickingScraper {
        fn kind(&self) -> &'static str {
            "panicking"
        }

        async fn scrape(&self, _board: &Board) -> Result<Vec<RawListing>, ScrapeError> {
            panic!("boom")
        }
    }

    fn board(id: BoardId, name: &str) -> Board {
        Board {
            id,
            name: name.into(),
            category: BoardCategory::General,
            url: None,
        }
    }

    fn listings() -> Vec<RawListing> {
        vec![RawListing {
            title: "Backend Developer".into(),
            company: Some("Acme".into()),
            url: Some("https://jobs.example/1".into()),
            location: None,
        }]
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap(),
        ))
    }

    #[tokio::test]
    async fn held_lease_rejects_a_second_run() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        let clock = clock();
        let now = clock.now();
        store
            .try_acquire_lease(LEASE_KEY, "other-run", now + chrono::Duration::hours(1), now)
            .await
            .unwrap();
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), clock, ScraperRegistry::new(), PipelineSettings::default());

        let err = orchestrator.run_pipeline().await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { ref holder, .. } if holder == "other-run"));
        assert!(store.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn board_listing_failure_is_fatal_but_recorded() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.fail_board_listing(true).await;
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), clock(), ScraperRegistry::new(), PipelineSettings::default());

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Failed);
        assert!(summary.run.errors[0].starts_with("Fatal error: listing boards"));
        let stored = store.get_run(summary.run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn missing_scraper_and_timeouts_fail_only_that_job() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha"), board(2, "Beta"), board(3, "Gamma")]).await);
        let scrapers = ScraperRegistry::new()
            .with(1, Arc::new(StaticScraper(listings())))
            .with(2, Arc::new(StalledScraper));
        let settings = PipelineSettings {
            job_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, settings);

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.run.total_jobs, 13);
        assert_eq!(summary.run.failed_jobs, 2);

        let scrape_jobs: Vec<_> = summary.jobs.iter().filter(|j| j.job_type == JobType::Scrape).collect();
        assert_eq!(scrape_jobs[0].status, JobStatus::Completed);
        assert!(scrape_jobs[1].error.as_deref().unwrap().contains("timed out"));
        assert!(scrape_jobs[2].error.as_deref().unwrap().contains("no scraper registered"));
        assert!(summary.run.errors.iter().any(|e| e.starts_with("Scrape failed for Beta")));
    }

    #[tokio::test]
    async fn scraper_panic_fails_only_its_job() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha"), board(2, "Beta")]).await);
        let scrapers = ScraperRegistry::new()
            .with(1, Arc::new(PanickingScraper))
            .with(2, Arc::new(PanickingScraper));
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, PipelineSettings::default());

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Partial);
        assert_eq!(summary.run.failed_jobs, 2);
        let scrape_errors: Vec<_> = summary
            .jobs
            .iter()
            .filter(|j| j.job_type == JobType::Scrape)
            .map(|j| j.error.clone().unwrap_or_default())
            .collect();
        assert_eq!(scrape_errors, vec!["scrape job panicked: boom"; 2]);
        assert_eq!(
            summary.run.errors[0],
            "Scrape failed for Alpha: scrape job panicked: boom"
        );

        let stored = store.get_run(summary.run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert!(orchestrator.run_pipeline().await.is_ok());
    }

    #[tokio::test]
    async fn crashed_run_is_recorded_failed_and_releases_the_lease() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.panic_on_board_listing(true).await;
        let clock = clock();
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), clock.clone(), ScraperRegistry::new(), PipelineSettings::default());

        let err = orchestrator.run_pipeline().await.unwrap_err();
        assert!(matches!(err, PipelineError::Panicked { ref message, .. } if message == "job_boards cursor poisoned"));

        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].end_time.is_some());
        assert_eq!(
            runs[0].errors,
            vec!["Fatal error: pipeline run panicked: job_boards cursor poisoned".to_string()]
        );

        let now = clock.now();
        let lease = store
            .try_acquire_lease(LEASE_KEY, "next-run", now + chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(lease, LeaseOutcome::Acquired);
        store.release_lease(LEASE_KEY, "next-run").await.unwrap();

        store.clear_faults().await;
        assert_eq!(orchestrator.run_pipeline().await.unwrap().run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn hung_store_call_times_out_and_fails_the_run() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.stall_board_listing(true).await;
        let settings = PipelineSettings {
            store_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), ScraperRegistry::new(), settings);

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Failed);
        assert_eq!(
            summary.run.errors,
            vec!["Fatal error: listing boards: reading boards timed out after 50ms".to_string()]
        );
        let stored = store.get_run(summary.run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn final_run_write_is_retried_once() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.fail_terminal_run_writes(1).await;
        let scrapers = ScraperRegistry::new().with(1, Arc::new(StaticScraper(listings())));
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, PipelineSettings::default());

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Completed);
        let stored = store.get_run(summary.run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unrecorded_final_run_is_reported_failed() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.fail_terminal_run_writes(2).await;
        let scrapers = ScraperRegistry::new().with(1, Arc::new(StaticScraper(listings())));
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, PipelineSettings::default());

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Failed);
        assert_eq!(
            summary.run.errors.last().map(String::as_str),
            Some("Fatal error: recording run result: store unavailable: pipeline_runs")
        );
        assert!(orchestrator.run_pipeline().await.is_ok());
    }

    #[tokio::test]
    async fn job_record_write_failures_do_not_fail_the_run() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        store.fail_job_writes(true).await;
        let scrapers = ScraperRegistry::new().with(1, Arc::new(StaticScraper(listings())));
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, PipelineSettings::default());

        let summary = orchestrator.run_pipeline().await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Completed);
        assert!(store.jobs_for_run(summary.run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_phase_samples_newest_postings() {
        let store = Arc::new(MemoryStore::with_boards([board(1, "Alpha")]).await);
        let many: Vec<RawListing> = (0..5)
            .map(|i| RawListing {
                title: format!("Data Analyst {i}"),
                company: Some("Acme".into()),
                url: Some(format!("https://jobs.example/{i}")),
                location: None,
            })
            .collect();
        let scrapers = ScraperRegistry::new().with(1, Arc::new(StaticScraper(many)));
        let settings = PipelineSettings {
            snapshot_sample_limit: 3,
            ..PipelineSettings::default()
        };
        let orchestrator = PipelineOrchestrator::new(store.clone(), clock(), scrapers, settings);
        orchestrator.run_pipeline().await.unwrap();

        let snapshots = store.raw_snapshots(1, 10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].posting_count, 5);
        assert_eq!(snapshots[0].new_postings, 5);
        assert_eq!(snapshots[0].data["postings"].as_array().unwrap().len(), 3);
        assert_eq!(snapshots[0].data["stats"]["active_postings"], 5);
    }

    #[test]
    fn run_stats_summarize_statuses_and_durations() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap();
        let mk = |status, total, completed, failed, secs: Option<i64>| PipelineRun {
            run_id: Uuid::new_v4(),
            status,
            start_time: start,
            end_time: secs.map(|s| start + chrono::Duration::seconds(s)),
            total_jobs: total,
            completed_jobs: completed,
            failed_jobs: failed,
            errors: Vec::new(),
        };
        let runs = vec![
            mk(RunStatus::Completed, 10, 10, 0, Some(30)),
            mk(RunStatus::Partial, 10, 8, 2, Some(90)),
            mk(RunStatus::Running, 0, 0, 0, None),
        ];
        let stats = summarize_runs(7, &runs);
        assert_eq!(stats.total_runs, 3);
        assert_eq!((stats.completed_runs, stats.partial_runs, stats.running_runs), (1, 1, 1));
        assert_eq!(stats.job_success_rate, Some(90.0));
        assert_eq!(stats.avg_duration_secs, Some(60.0));
        assert_eq!(summarize_runs(7, &[]).job_success_rate, None);
    }
}
