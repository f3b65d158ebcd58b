//! Core domain model for JBES: boards, postings, lifecycle events, scores and
//! pipeline run records.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use titles::{normalize_job_title, title_similarity, RoleFamily};

pub const CRATE_NAME: &str = "jbes-core";

pub type BoardId = i64;
pub type PostingId = i64;

pub const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub mod titles;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardCategory {
    General,
    Tech,
    Remote,
    Niche,
}

string_enum!(BoardCategory, "board category", {
    General => "general",
    Tech => "tech",
    Remote => "remote",
    Niche => "niche",
});

/// Static registry entry for one job board. Owned externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub name: String,
    pub category: BoardCategory,
    pub url: Option<String>,
}

/// Raw listing handed from a board scraper to the ingestion step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostingStatus {
    New,
    Active,
    Disappeared,
}

/// One observed job advertisement on one board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    pub board_id: BoardId,
    pub title: String,
    pub company: Option<String>,
    pub url: Option<String>,
    pub normalized_title: RoleFamily,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub disappeared: bool,
    pub disappeared_at: Option<DateTime<Utc>>,
    pub lifespan_days: Option<i64>,
    pub repost_count: i64,
    pub repost_cluster_id: Option<PostingId>,
}

impl Posting {
    pub fn status(&self) -> PostingStatus {
        if self.first_seen.is_none() {
            PostingStatus::New
        } else if self.disappeared {
            PostingStatus::Disappeared
        } else {
            PostingStatus::Active
        }
    }

    /// Company name if present and non-blank.
    pub fn company_name(&self) -> Option<&str> {
        non_blank(self.company.as_deref())
    }

    /// URL if present and non-blank.
    pub fn canonical_url(&self) -> Option<&str> {
        non_blank(self.url.as_deref())
    }

    /// `disappeared_at` when frozen, otherwise `last_seen`.
    pub fn effective_end(&self) -> Option<DateTime<Utc>> {
        self.disappeared_at.or(self.last_seen)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Insert payload for a posting that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPosting {
    pub board_id: BoardId,
    pub title: String,
    pub company: Option<String>,
    pub url: Option<String>,
    pub normalized_title: RoleFamily,
}

impl NewPosting {
    pub fn from_listing(board_id: BoardId, listing: &RawListing) -> Self {
        Self {
            board_id,
            title: listing.title.trim().to_string(),
            company: non_blank(listing.company.as_deref()).map(str::to_string),
            url: non_blank(listing.url.as_deref()).map(str::to_string),
            normalized_title: normalize_job_title(&listing.title),
        }
    }
}

/// Whole days covered by `[start, end]`, rounded up and floored at zero.
pub fn days_between_ceil(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingEventType {
    Appeared,
    Reappeared,
    Disappeared,
    RepostDetected,
}

string_enum!(PostingEventType, "posting event type", {
    Appeared => "appeared",
    Reappeared => "reappeared",
    Disappeared => "disappeared",
    RepostDetected => "repost_detected",
});

/// Append-only lifecycle log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingEvent {
    pub posting_id: PostingId,
    pub event_type: PostingEventType,
    pub event_date: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Survey ratings for one board, each on a 1-5 scale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurveyRatings {
    pub employer: Vec<f64>,
    pub candidate: Vec<f64>,
}

/// One computed efficiency score row. Rows are appended, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyScore {
    pub board_id: BoardId,
    pub overall_score: i32,
    pub lifespan_score: f64,
    pub repost_score: f64,
    pub employer_survey_score: f64,
    pub candidate_survey_score: f64,
    pub quality_adjustment: f64,
    pub data_completeness: f64,
    pub percentile: Option<i32>,
    pub computed_at: DateTime<Utc>,
}

/// Daily per-board rollup; at most one per `(board_id, snapshot_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub board_id: BoardId,
    pub snapshot_date: NaiveDate,
    pub overall_score: f64,
    pub avg_lifespan_days: Option<f64>,
    pub avg_repost_rate: Option<f64>,
    pub avg_employer_score: Option<f64>,
    pub avg_candidate_score: Option<f64>,
    pub total_postings: i64,
}

/// Point-in-time board counts written by the snapshot phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataSnapshot {
    pub board_id: BoardId,
    pub snapshot_date: NaiveDate,
    pub posting_count: i64,
    pub new_postings: i64,
    pub active_postings: i64,
    pub disappeared_postings: i64,
    pub repost_count: i64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Scrape,
    Snapshot,
    Lifespan,
    Repost,
    Score,
}

string_enum!(JobType, "job type", {
    Scrape => "scrape",
    Snapshot => "snapshot",
    Lifespan => "lifespan",
    Repost => "repost",
    Score => "score",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
});

impl RunStatus {
    /// Aggregate status once every job of a run is terminal.
    pub fn from_counts(total: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::Completed
        } else if failed >= total {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub run_id: Uuid,
    pub job_type: JobType,
    pub board_id: Option<BoardId>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl PipelineJob {
    pub fn pending(run_id: Uuid, job_type: JobType, board_id: Option<BoardId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            job_type,
            board_id,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub errors: Vec<String>,
}

/// Time source for every lifecycle and pipeline timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn day_span_rounds_partial_days_up() {
        assert_eq!(days_between_ceil(ts(1, 0), ts(14, 0)), 13);
        assert_eq!(days_between_ceil(ts(1, 0), ts(1, 1)), 1);
        assert_eq!(days_between_ceil(ts(1, 0), ts(1, 0)), 0);
        assert_eq!(days_between_ceil(ts(5, 0), ts(1, 0)), 0);
    }

    #[test]
    fn run_status_follows_failed_job_count() {
        assert_eq!(RunStatus::from_counts(0, 0), RunStatus::Completed);
        assert_eq!(RunStatus::from_counts(6, 0), RunStatus::Completed);
        assert_eq!(RunStatus::from_counts(6, 2), RunStatus::Partial);
        assert_eq!(RunStatus::from_counts(6, 6), RunStatus::Failed);
    }

    #[test]
    fn posting_status_tracks_lifecycle_fields() {
        let mut posting = Posting {
            id: 1,
            board_id: 1,
            title: "Backend Developer".into(),
            company: Some("  ".into()),
            url: None,
            normalized_title: RoleFamily::SoftwareEngineer,
            first_seen: None,
            last_seen: None,
            disappeared: false,
            disappeared_at: None,
            lifespan_days: None,
            repost_count: 0,
            repost_cluster_id: None,
        };
        assert_eq!(posting.status(), PostingStatus::New);
        assert_eq!(posting.company_name(), None);

        posting.first_seen = Some(ts(1, 0));
        posting.last_seen = Some(ts(3, 0));
        assert_eq!(posting.status(), PostingStatus::Active);
        assert_eq!(posting.effective_end(), Some(ts(3, 0)));

        posting.disappeared = true;
        posting.disappeared_at = Some(ts(2, 0));
        assert_eq!(posting.status(), PostingStatus::Disappeared);
        assert_eq!(posting.effective_end(), Some(ts(2, 0)));
    }

    #[test]
    fn enum_slugs_round_trip_through_strings() {
        assert_eq!("repost_detected".parse::<PostingEventType>().unwrap(), PostingEventType::RepostDetected);
        assert_eq!(JobType::Lifespan.as_str(), "lifespan");
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(ts(1, 0));
        clock.advance(Duration::days(2));
        assert_eq!(clock.now(), ts(3, 0));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
    }
}
