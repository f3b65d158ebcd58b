//! Record store contract, in-memory and Postgres stores, and HTTP fetch
//! utilities for JBES.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jbes_core::{
    Board, BoardId, EfficiencyScore, NewPosting, PipelineJob, PipelineRun, Posting,
    PostingEvent, PostingEventType, PostingId, RawDataSnapshot, RoleFamily, SurveyRatings,
    TrendSnapshot,
};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "jbes-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostingOrder {
    #[default]
    IdAsc,
    FirstSeenAsc,
    FirstSeenDesc,
}

/// Equality and range filter over stored postings. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingFilter {
    pub board_id: Option<BoardId>,
    pub role_family: Option<RoleFamily>,
    pub url: Option<String>,
    pub disappeared: Option<bool>,
    pub has_lifespan: Option<bool>,
    pub first_seen_from: Option<DateTime<Utc>>,
    pub order: PostingOrder,
    pub limit: Option<usize>,
}

impl PostingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_board(board_id: BoardId) -> Self {
        Self {
            board_id: Some(board_id),
            ..Self::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.disappeared = Some(false);
        self
    }

    pub fn disappeared(mut self) -> Self {
        self.disappeared = Some(true);
        self
    }

    pub fn with_role_family(mut self, family: RoleFamily) -> Self {
        self.role_family = Some(family);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_lifespan(mut self) -> Self {
        self.has_lifespan = Some(true);
        self
    }

    pub fn first_seen_from(mut self, from: DateTime<Utc>) -> Self {
        self.first_seen_from = Some(from);
        self
    }

    pub fn ordered(mut self, order: PostingOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, posting: &Posting) -> bool {
        if self.board_id.is_some_and(|b| b != posting.board_id) {
            return false;
        }
        if self.role_family.is_some_and(|f| f != posting.normalized_title) {
            return false;
        }
        if let Some(url) = &self.url {
            if posting.url.as_deref() != Some(url.as_str()) {
                return false;
            }
        }
        if self.disappeared.is_some_and(|d| d != posting.disappeared) {
            return false;
        }
        if self
            .has_lifespan
            .is_some_and(|want| want != posting.lifespan_days.is_some())
        {
            return false;
        }
        if let Some(from) = self.first_seen_from {
            if !posting.first_seen.is_some_and(|seen| seen >= from) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

/// Typed record store the pipeline reads from and writes to.
///
/// Postings, trend snapshots, runs and jobs are upserted; events, scores and
/// raw snapshots are append-only.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_boards(&self) -> StoreResult<Vec<Board>>;
    async fn get_board(&self, board_id: BoardId) -> StoreResult<Option<Board>>;
    async fn upsert_board(&self, board: &Board) -> StoreResult<()>;

    async fn insert_posting(&self, posting: &NewPosting) -> StoreResult<Posting>;
    async fn get_posting(&self, posting_id: PostingId) -> StoreResult<Option<Posting>>;
    async fn select_postings(&self, filter: &PostingFilter) -> StoreResult<Vec<Posting>>;
    async fn count_postings(&self, filter: &PostingFilter) -> StoreResult<i64>;
    /// Writes the lifecycle columns of `posting` (first/last seen, disappearance, lifespan).
    async fn update_posting_lifecycle(&self, posting: &Posting) -> StoreResult<()>;
    async fn set_repost_count(&self, posting_id: PostingId, repost_count: i64) -> StoreResult<()>;
    async fn set_repost_cluster(
        &self,
        posting_id: PostingId,
        cluster_id: Option<PostingId>,
    ) -> StoreResult<()>;

    async fn append_event(&self, event: &PostingEvent) -> StoreResult<()>;
    async fn posting_events(&self, posting_id: PostingId) -> StoreResult<Vec<PostingEvent>>;
    async fn board_events(
        &self,
        board_id: BoardId,
        event_type: Option<PostingEventType>,
    ) -> StoreResult<Vec<PostingEvent>>;

    async fn survey_ratings(&self, board_id: BoardId) -> StoreResult<SurveyRatings>;

    async fn insert_score(&self, score: &EfficiencyScore) -> StoreResult<()>;
    /// Most recent score row per board.
    async fn latest_scores(&self) -> StoreResult<Vec<EfficiencyScore>>;
    async fn board_scores(
        &self,
        board_id: BoardId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EfficiencyScore>>;

    async fn upsert_trend_snapshot(&self, snapshot: &TrendSnapshot) -> StoreResult<()>;
    /// Snapshots on or after `since`, oldest first.
    async fn trend_snapshots(
        &self,
        board_id: BoardId,
        since: NaiveDate,
    ) -> StoreResult<Vec<TrendSnapshot>>;

    async fn insert_raw_snapshot(&self, snapshot: &RawDataSnapshot) -> StoreResult<()>;
    async fn raw_snapshots(&self, board_id: BoardId, limit: usize) -> StoreResult<Vec<RawDataSnapshot>>;

    async fn upsert_run(&self, run: &PipelineRun) -> StoreResult<()>;
    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>>;
    /// Runs newest first.
    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<PipelineRun>>;
    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>>;
    async fn upsert_job(&self, job: &PipelineJob) -> StoreResult<()>;
    async fn jobs_for_run(&self, run_id: Uuid) -> StoreResult<Vec<PipelineJob>>;

    /// Takes `key` for `holder` unless another holder's lease is still live at `now`.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome>;
    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()>;
}
