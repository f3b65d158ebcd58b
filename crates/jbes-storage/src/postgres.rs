//! Postgres-backed [`RecordStore`] using sqlx runtime queries.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jbes_core::{
    Board, BoardId, EfficiencyScore, NewPosting, PipelineJob, PipelineRun, Posting,
    PostingEvent, PostingEventType, PostingId, RawDataSnapshot, SurveyRatings, TrendSnapshot,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::{LeaseOutcome, PostingFilter, PostingOrder, RecordStore, StoreError, StoreResult};

const POSTING_COLUMNS: &str = "id, board_id, title, company, url, normalized_title, first_seen, \
     last_seen, disappeared, disappeared_at, lifespan_days, repost_count, repost_cluster_id";

const SCORE_COLUMNS: &str = "job_board_id, overall_score, lifespan_score, repost_score, \
     employer_survey_score, candidate_survey_score, quality_adjustment, data_completeness, \
     percentile, computed_at";

const TREND_COLUMNS: &str = "job_board_id, snapshot_date, overall_score, avg_lifespan_days, \
     avg_repost_rate, avg_employer_score, avg_candidate_score, total_postings";

const RUN_COLUMNS: &str =
    "run_id, status, start_time, end_time, total_jobs, completed_jobs, failed_jobs, errors";

const JOB_COLUMNS: &str =
    "id, run_id, job_type, job_board_id, status, started_at, completed_at, result, error";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Decode(format!("{column}: {e}")))
}

fn board_from_row(row: &PgRow) -> StoreResult<Board> {
    Ok(Board {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: parse_column(row, "category")?,
        url: row.try_get("url")?,
    })
}

fn posting_from_row(row: &PgRow) -> StoreResult<Posting> {
    Ok(Posting {
        id: row.try_get("id")?,
        board_id: row.try_get("board_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        url: row.try_get("url")?,
        normalized_title: parse_column(row, "normalized_title")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        disappeared: row.try_get("disappeared")?,
        disappeared_at: row.try_get("disappeared_at")?,
        lifespan_days: row.try_get("lifespan_days")?,
        repost_count: row.try_get("repost_count")?,
        repost_cluster_id: row.try_get("repost_cluster_id")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<PostingEvent> {
    Ok(PostingEvent {
        posting_id: row.try_get("job_posting_id")?,
        event_type: parse_column(row, "event_type")?,
        event_date: row.try_get("event_date")?,
        notes: row.try_get("notes")?,
    })
}

fn score_from_row(row: &PgRow) -> StoreResult<EfficiencyScore> {
    Ok(EfficiencyScore {
        board_id: row.try_get("job_board_id")?,
        overall_score: row.try_get("overall_score")?,
        lifespan_score: row.try_get("lifespan_score")?,
        repost_score: row.try_get("repost_score")?,
        employer_survey_score: row.try_get("employer_survey_score")?,
        candidate_survey_score: row.try_get("candidate_survey_score")?,
        quality_adjustment: row.try_get("quality_adjustment")?,
        data_completeness: row.try_get("data_completeness")?,
        percentile: row.try_get("percentile")?,
        computed_at: row.try_get("computed_at")?,
    })
}

fn trend_from_row(row: &PgRow) -> StoreResult<TrendSnapshot> {
    Ok(TrendSnapshot {
        board_id: row.try_get("job_board_id")?,
        snapshot_date: row.try_get("snapshot_date")?,
        overall_score: row.try_get("overall_score")?,
        avg_lifespan_days: row.try_get("avg_lifespan_days")?,
        avg_repost_rate: row.try_get("avg_repost_rate")?,
        avg_employer_score: row.try_get("avg_employer_score")?,
        avg_candidate_score: row.try_get("avg_candidate_score")?,
        total_postings: row.try_get("total_postings")?,
    })
}

fn raw_snapshot_from_row(row: &PgRow) -> StoreResult<RawDataSnapshot> {
    Ok(RawDataSnapshot {
        board_id: row.try_get("job_board_id")?,
        snapshot_date: row.try_get("snapshot_date")?,
        posting_count: row.try_get("posting_count")?,
        new_postings: row.try_get("new_postings")?,
        active_postings: row.try_get("active_postings")?,
        disappeared_postings: row.try_get("disappeared_postings")?,
        repost_count: row.try_get("repost_count")?,
        data: row.try_get("data")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<PipelineRun> {
    let errors: serde_json::Value = row.try_get("errors")?;
    Ok(PipelineRun {
        run_id: row.try_get("run_id")?,
        status: parse_column(row, "status")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        total_jobs: row.try_get("total_jobs")?,
        completed_jobs: row.try_get("completed_jobs")?,
        failed_jobs: row.try_get("failed_jobs")?,
        errors: serde_json::from_value(errors)?,
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<PipelineJob> {
    Ok(PipelineJob {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        job_type: parse_column(row, "job_type")?,
        board_id: row.try_get("job_board_id")?,
        status: parse_column(row, "status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

fn push_posting_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &PostingFilter) {
    if let Some(board_id) = filter.board_id {
        qb.push(" AND board_id = ").push_bind(board_id);
    }
    if let Some(family) = filter.role_family {
        qb.push(" AND normalized_title = ").push_bind(family.as_str());
    }
    if let Some(url) = &filter.url {
        qb.push(" AND url = ").push_bind(url.clone());
    }
    if let Some(disappeared) = filter.disappeared {
        qb.push(" AND disappeared = ").push_bind(disappeared);
    }
    match filter.has_lifespan {
        Some(true) => {
            qb.push(" AND lifespan_days IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND lifespan_days IS NULL");
        }
        None => {}
    }
    if let Some(from) = filter.first_seen_from {
        qb.push(" AND first_seen >= ").push_bind(from);
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn list_boards(&self) -> StoreResult<Vec<Board>> {
        let rows = sqlx::query("SELECT id, name, category, url FROM job_boards ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(board_from_row).collect()
    }

    async fn get_board(&self, board_id: BoardId) -> StoreResult<Option<Board>> {
        let row = sqlx::query("SELECT id, name, category, url FROM job_boards WHERE id = $1")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(board_from_row).transpose()
    }

    async fn upsert_board(&self, board: &Board) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_boards (id, name, category, url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, category = EXCLUDED.category, url = EXCLUDED.url
            "#,
        )
        .bind(board.id)
        .bind(&board.name)
        .bind(board.category.as_str())
        .bind(&board.url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_posting(&self, posting: &NewPosting) -> StoreResult<Posting> {
        let sql = format!(
            "INSERT INTO job_postings (board_id, title, company, url, normalized_title) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {POSTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(posting.board_id)
            .bind(&posting.title)
            .bind(&posting.company)
            .bind(&posting.url)
            .bind(posting.normalized_title.as_str())
            .fetch_one(&self.pool)
            .await?;
        posting_from_row(&row)
    }

    async fn get_posting(&self, posting_id: PostingId) -> StoreResult<Option<Posting>> {
        let sql = format!("SELECT {POSTING_COLUMNS} FROM job_postings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(posting_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn select_postings(&self, filter: &PostingFilter) -> StoreResult<Vec<Posting>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {POSTING_COLUMNS} FROM job_postings WHERE TRUE"
        ));
        push_posting_filter(&mut qb, filter);
        qb.push(match filter.order {
            PostingOrder::IdAsc => " ORDER BY id ASC",
            PostingOrder::FirstSeenAsc => " ORDER BY first_seen ASC NULLS FIRST, id ASC",
            PostingOrder::FirstSeenDesc => " ORDER BY first_seen DESC NULLS LAST, id DESC",
        });
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(posting_from_row).collect()
    }

    async fn count_postings(&self, filter: &PostingFilter) -> StoreResult<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM job_postings WHERE TRUE");
        push_posting_filter(&mut qb, filter);
        Ok(qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?)
    }

    async fn update_posting_lifecycle(&self, posting: &Posting) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_postings
            SET first_seen = $2, last_seen = $3, disappeared = $4,
                disappeared_at = $5, lifespan_days = $6
            WHERE id = $1
            "#,
        )
        .bind(posting.id)
        .bind(posting.first_seen)
        .bind(posting.last_seen)
        .bind(posting.disappeared)
        .bind(posting.disappeared_at)
        .bind(posting.lifespan_days)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("posting", posting.id));
        }
        Ok(())
    }

    async fn set_repost_count(&self, posting_id: PostingId, repost_count: i64) -> StoreResult<()> {
        sqlx::query("UPDATE job_postings SET repost_count = $2 WHERE id = $1")
            .bind(posting_id)
            .bind(repost_count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_repost_cluster(
        &self,
        posting_id: PostingId,
        cluster_id: Option<PostingId>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE job_postings SET repost_cluster_id = $2 WHERE id = $1")
            .bind(posting_id)
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_event(&self, event: &PostingEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO posting_events (job_posting_id, event_type, event_date, notes) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.posting_id)
        .bind(event.event_type.as_str())
        .bind(event.event_date)
        .bind(&event.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn posting_events(&self, posting_id: PostingId) -> StoreResult<Vec<PostingEvent>> {
        let rows = sqlx::query(
            "SELECT job_posting_id, event_type, event_date, notes FROM posting_events \
             WHERE job_posting_id = $1 ORDER BY event_date ASC, id ASC",
        )
        .bind(posting_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn board_events(
        &self,
        board_id: BoardId,
        event_type: Option<PostingEventType>,
    ) -> StoreResult<Vec<PostingEvent>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT e.job_posting_id, e.event_type, e.event_date, e.notes \
             FROM posting_events e JOIN job_postings p ON p.id = e.job_posting_id \
             WHERE p.board_id = ",
        );
        qb.push_bind(board_id);
        if let Some(event_type) = event_type {
            qb.push(" AND e.event_type = ").push_bind(event_type.as_str());
        }
        qb.push(" ORDER BY e.event_date ASC, e.id ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn survey_ratings(&self, board_id: BoardId) -> StoreResult<SurveyRatings> {
        let employer = sqlx::query_scalar::<_, f64>(
            "SELECT board_hiring_efficiency::float8 FROM employer_surveys \
             WHERE job_board_id = $1 AND board_hiring_efficiency IS NOT NULL",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        let candidate = sqlx::query_scalar::<_, f64>(
            "SELECT board_visibility_rating::float8 FROM candidate_surveys \
             WHERE job_board_id = $1 AND board_visibility_rating IS NOT NULL",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(SurveyRatings {
            employer,
            candidate,
        })
    }

    async fn insert_score(&self, score: &EfficiencyScore) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO efficiency_scores ({SCORE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        sqlx::query(&sql)
            .bind(score.board_id)
            .bind(score.overall_score)
            .bind(score.lifespan_score)
            .bind(score.repost_score)
            .bind(score.employer_survey_score)
            .bind(score.candidate_survey_score)
            .bind(score.quality_adjustment)
            .bind(score.data_completeness)
            .bind(score.percentile)
            .bind(score.computed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_scores(&self) -> StoreResult<Vec<EfficiencyScore>> {
        let sql = format!(
            "SELECT DISTINCT ON (job_board_id) {SCORE_COLUMNS} FROM efficiency_scores \
             ORDER BY job_board_id, computed_at DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(score_from_row).collect()
    }

    async fn board_scores(
        &self,
        board_id: BoardId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<EfficiencyScore>> {
        let sql = format!(
            "SELECT {SCORE_COLUMNS} FROM efficiency_scores \
             WHERE job_board_id = $1 AND computed_at >= $2 ORDER BY computed_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(board_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(score_from_row).collect()
    }

    async fn upsert_trend_snapshot(&self, snapshot: &TrendSnapshot) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO trend_snapshots ({TREND_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (job_board_id, snapshot_date) DO UPDATE SET \
             overall_score = EXCLUDED.overall_score, \
             avg_lifespan_days = EXCLUDED.avg_lifespan_days, \
             avg_repost_rate = EXCLUDED.avg_repost_rate, \
             avg_employer_score = EXCLUDED.avg_employer_score, \
             avg_candidate_score = EXCLUDED.avg_candidate_score, \
             total_postings = EXCLUDED.total_postings"
        );
        sqlx::query(&sql)
            .bind(snapshot.board_id)
            .bind(snapshot.snapshot_date)
            .bind(snapshot.overall_score)
            .bind(snapshot.avg_lifespan_days)
            .bind(snapshot.avg_repost_rate)
            .bind(snapshot.avg_employer_score)
            .bind(snapshot.avg_candidate_score)
            .bind(snapshot.total_postings)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trend_snapshots(
        &self,
        board_id: BoardId,
        since: NaiveDate,
    ) -> StoreResult<Vec<TrendSnapshot>> {
        let sql = format!(
            "SELECT {TREND_COLUMNS} FROM trend_snapshots \
             WHERE job_board_id = $1 AND snapshot_date >= $2 ORDER BY snapshot_date ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(board_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trend_from_row).collect()
    }

    async fn insert_raw_snapshot(&self, snapshot: &RawDataSnapshot) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_data_snapshots
                (job_board_id, snapshot_date, posting_count, new_postings, active_postings,
                 disappeared_postings, repost_count, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(snapshot.board_id)
        .bind(snapshot.snapshot_date)
        .bind(snapshot.posting_count)
        .bind(snapshot.new_postings)
        .bind(snapshot.active_postings)
        .bind(snapshot.disappeared_postings)
        .bind(snapshot.repost_count)
        .bind(&snapshot.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn raw_snapshots(&self, board_id: BoardId, limit: usize) -> StoreResult<Vec<RawDataSnapshot>> {
        let rows = sqlx::query(
            "SELECT job_board_id, snapshot_date, posting_count, new_postings, active_postings, \
             disappeared_postings, repost_count, data FROM raw_data_snapshots \
             WHERE job_board_id = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(board_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_snapshot_from_row).collect()
    }

    async fn upsert_run(&self, run: &PipelineRun) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO pipeline_runs ({RUN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (run_id) DO UPDATE SET status = EXCLUDED.status, \
             end_time = EXCLUDED.end_time, total_jobs = EXCLUDED.total_jobs, \
             completed_jobs = EXCLUDED.completed_jobs, failed_jobs = EXCLUDED.failed_jobs, \
             errors = EXCLUDED.errors"
        );
        sqlx::query(&sql)
            .bind(run.run_id)
            .bind(run.status.as_str())
            .bind(run.start_time)
            .bind(run.end_time)
            .bind(run.total_jobs)
            .bind(run.completed_jobs)
            .bind(run.failed_jobs)
            .bind(serde_json::to_value(&run.errors)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, limit: usize) -> StoreResult<Vec<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY start_time DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PipelineRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE start_time >= $1 ORDER BY start_time DESC"
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn upsert_job(&self, job: &PipelineJob) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO pipeline_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, \
             started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at, \
             result = EXCLUDED.result, error = EXCLUDED.error"
        );
        sqlx::query(&sql)
            .bind(job.id)
            .bind(job.run_id)
            .bind(job.job_type.as_str())
            .bind(job.board_id)
            .bind(job.status.as_str())
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(&job.result)
            .bind(&job.error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn jobs_for_run(&self, run_id: Uuid) -> StoreResult<Vec<PipelineJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE run_id = $1 ORDER BY started_at ASC NULLS LAST"
        );
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let acquired = sqlx::query(
            r#"
            INSERT INTO pipeline_leases (lease_key, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lease_key) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE pipeline_leases.holder = EXCLUDED.holder OR pipeline_leases.expires_at <= $4
            RETURNING holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if acquired.is_some() {
            return Ok(LeaseOutcome::Acquired);
        }

        let row = sqlx::query("SELECT holder, expires_at FROM pipeline_leases WHERE lease_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(LeaseOutcome::Held {
            holder: row.try_get("holder")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM pipeline_leases WHERE lease_key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
