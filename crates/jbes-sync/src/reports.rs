use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::RunSummary;

const MANIFEST_SCHEMA_VERSION: u32 = 2;

/// Index of one run's parquet snapshots, so a consumer can verify them
/// without opening the files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParquetManifestFile {
    pub table: String,
    /// Relative to the run's report directory.
    pub path: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<root>/<run_id>/` with the run brief, score JSON and parquet
/// snapshots. Returns the run's report directory.
pub async fn write_run_reports(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;

    let scores_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary.run,
        "scores": summary.scores,
    }))
    .context("serializing scores")?;
    fs::write(reports_dir.join("scores.json"), scores_json)
        .await
        .context("writing scores.json")?;

    export_parquet_snapshots(&reports_dir, summary).await?;
    Ok(reports_dir)
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let run = &summary.run;
    let finished = run
        .end_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let errors = if run.errors.is_empty() {
        "- none".to_string()
    } else {
        run.errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let scores = if summary.scores.is_empty() {
        "No boards scored.".to_string()
    } else {
        let rows = summary
            .scores
            .iter()
            .map(|r| {
                format!(
                    "| {} | {} | {} | {} | {} |",
                    r.rank,
                    summary.board_name(r.score.board_id),
                    r.score.overall_score,
                    r.grade.as_str(),
                    r.score
                        .percentile
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("| Rank | Board | Score | Grade | Percentile |\n|---|---|---|---|---|\n{rows}")
    };
    format!(
        "# JBES Run Brief\n\n- Run ID: `{}`\n- Status: {}\n- Started: {}\n- Finished: {}\n- Jobs: {} total, {} completed, {} failed\n\n## Errors\n{}\n\n## Efficiency Scores\n{}\n",
        run.run_id,
        run.status,
        run.start_time.to_rfc3339(),
        finished,
        run.total_jobs,
        run.completed_jobs,
        run.failed_jobs,
        errors,
        scores,
    )
}

async fn export_parquet_snapshots(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::new();
    for (table, batch) in [
        ("efficiency_scores", scores_batch(summary)?),
        ("pipeline_jobs", jobs_batch(summary)?),
    ] {
        files.push(write_table(reports_dir, &snapshot_dir, table, &batch).await?);
    }

    let manifest = ParquetManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        run_id: summary.run.run_id,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Encodes `batch` as `<table>.parquet` and describes it for the manifest.
/// The digest is taken from the encoded buffer, so the file is written once
/// and never read back.
async fn write_table(
    reports_dir: &Path,
    snapshot_dir: &Path,
    table: &str,
    batch: &RecordBatch,
) -> Result<ParquetManifestFile> {
    let mut encoded = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut encoded, batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {table}"))?;
    writer
        .write(batch)
        .with_context(|| format!("encoding {table} rows"))?;
    writer
        .close()
        .with_context(|| format!("finishing {table} parquet"))?;

    let path = snapshot_dir.join(format!("{table}.parquet"));
    fs::write(&path, &encoded)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(ParquetManifestFile {
        table: table.to_string(),
        path: path
            .strip_prefix(reports_dir)
            .unwrap_or(&path)
            .display()
            .to_string(),
        rows: batch.num_rows(),
        columns: batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect(),
        sha256: hex::encode(Sha256::digest(&encoded)),
        bytes: encoded.len() as u64,
    })
}

fn scores_batch(summary: &RunSummary) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("board_id", DataType::Int64, false),
        ArrowField::new("board_name", DataType::Utf8, false),
        ArrowField::new("rank", DataType::Int64, false),
        ArrowField::new("grade", DataType::Utf8, false),
        ArrowField::new("overall_score", DataType::Int32, false),
        ArrowField::new("lifespan_score", DataType::Float64, false),
        ArrowField::new("repost_score", DataType::Float64, false),
        ArrowField::new("employer_survey_score", DataType::Float64, false),
        ArrowField::new("candidate_survey_score", DataType::Float64, false),
        ArrowField::new("quality_adjustment", DataType::Float64, false),
        ArrowField::new("data_completeness", DataType::Float64, false),
        ArrowField::new("percentile", DataType::Int32, true),
    ]));
    let scores = &summary.scores;

    let board_ids = Int64Array::from(scores.iter().map(|r| r.score.board_id).collect::<Vec<_>>());
    let names = StringArray::from(
        scores
            .iter()
            .map(|r| Some(summary.board_name(r.score.board_id)))
            .collect::<Vec<_>>(),
    );
    let ranks = Int64Array::from(scores.iter().map(|r| r.rank as i64).collect::<Vec<_>>());
    let grades = StringArray::from(scores.iter().map(|r| Some(r.grade.as_str())).collect::<Vec<_>>());
    let overall = Int32Array::from(scores.iter().map(|r| r.score.overall_score).collect::<Vec<_>>());
    let float_col = |f: fn(&jbes_core::EfficiencyScore) -> f64| {
        Float64Array::from(scores.iter().map(|r| f(&r.score)).collect::<Vec<_>>())
    };
    let percentiles = Int32Array::from(scores.iter().map(|r| r.score.percentile).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(board_ids),
            Arc::new(names),
            Arc::new(ranks),
            Arc::new(grades),
            Arc::new(overall),
            Arc::new(float_col(|s| s.lifespan_score)),
            Arc::new(float_col(|s| s.repost_score)),
            Arc::new(float_col(|s| s.employer_survey_score)),
            Arc::new(float_col(|s| s.candidate_survey_score)),
            Arc::new(float_col(|s| s.quality_adjustment)),
            Arc::new(float_col(|s| s.data_completeness)),
            Arc::new(percentiles),
        ],
    )
    .context("building efficiency_scores record batch")
}

fn jobs_batch(summary: &RunSummary) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("job_id", DataType::Utf8, false),
        ArrowField::new("job_type", DataType::Utf8, false),
        ArrowField::new("board_id", DataType::Int64, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("duration_ms", DataType::Int64, true),
        ArrowField::new("error", DataType::Utf8, true),
    ]));
    let jobs = &summary.jobs;

    let ids = StringArray::from(jobs.iter().map(|j| Some(j.id.to_string())).collect::<Vec<_>>());
    let types = StringArray::from(jobs.iter().map(|j| Some(j.job_type.to_string())).collect::<Vec<_>>());
    let boards = Int64Array::from(jobs.iter().map(|j| j.board_id).collect::<Vec<_>>());
    let statuses = StringArray::from(jobs.iter().map(|j| Some(j.status.to_string())).collect::<Vec<_>>());
    let durations = Int64Array::from(
        jobs.iter()
            .map(|j| Some((j.completed_at? - j.started_at?).num_milliseconds()))
            .collect::<Vec<_>>(),
    );
    let errors = StringArray::from(jobs.iter().map(|j| j.error.as_deref()).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(types),
            Arc::new(boards),
            Arc::new(statuses),
            Arc::new(durations),
            Arc::new(errors),
        ],
    )
    .context("building pipeline_jobs record batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::rank_scores;
    use chrono::{TimeZone, Utc};
    use jbes_core::{EfficiencyScore, JobStatus, JobType, PipelineJob, PipelineRun, RunStatus};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn mk_score(board_id: i64, overall: i32) -> EfficiencyScore {
        EfficiencyScore {
            board_id,
            overall_score: overall,
            lifespan_score: 80.0,
            repost_score: 70.0,
            employer_survey_score: 50.0,
            candidate_survey_score: 50.0,
            quality_adjustment: 5.0,
            data_completeness: 60.0,
            percentile: None,
            computed_at: Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap(),
        }
    }

    fn mk_summary() -> RunSummary {
        let run_id = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap();
        let mut failed = PipelineJob::pending(run_id, JobType::Scrape, Some(2));
        failed.status = JobStatus::Failed;
        failed.error = Some("connection refused".into());
        RunSummary {
            run: PipelineRun {
                run_id,
                status: RunStatus::Partial,
                start_time: start,
                end_time: Some(start + chrono::Duration::seconds(42)),
                total_jobs: 2,
                completed_jobs: 1,
                failed_jobs: 1,
                errors: vec!["Scrape failed for Beta: connection refused".into()],
            },
            jobs: vec![PipelineJob::pending(run_id, JobType::Scrape, Some(1)), failed],
            scores: rank_scores(vec![mk_score(1, 91), mk_score(3, 64)]),
            board_names: BTreeMap::from([
                (1, "Alpha".to_string()),
                (2, "Beta".to_string()),
                (3, "Gamma".to_string()),
            ]),
            reports_dir: None,
        }
    }

    #[test]
    fn brief_lists_errors_and_ranked_grades() {
        let brief = run_brief_markdown(&mk_summary());
        assert!(brief.starts_with("# JBES Run Brief"));
        assert!(brief.contains("- Status: partial"));
        assert!(brief.contains("- Scrape failed for Beta: connection refused"));
        assert!(brief.contains("| 1 | Alpha | 91 | A+ | 100 |"));
        assert!(brief.contains("| 2 | Gamma | 64 | C | 50 |"));
    }

    #[tokio::test]
    async fn reports_and_manifest_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let summary = mk_summary();
        let out = write_run_reports(dir.path(), &summary).await.unwrap();

        assert_eq!(out, dir.path().join(summary.run.run_id.to_string()));
        assert!(out.join("run_brief.md").exists());
        let scores: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("scores.json")).unwrap()).unwrap();
        assert_eq!(scores["scores"][0]["score"]["board_id"], 1);

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(out.join("snapshots/manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.run_id, summary.run.run_id);
        let tables: Vec<(&str, usize)> = manifest.files.iter().map(|f| (f.table.as_str(), f.rows)).collect();
        assert_eq!(tables, vec![("efficiency_scores", 2), ("pipeline_jobs", 2)]);

        let entry = &manifest.files[0];
        assert_eq!(entry.path, "snapshots/efficiency_scores.parquet");
        assert_eq!(entry.columns[0], "board_id");
        let bytes = std::fs::read(out.join(&entry.path)).unwrap();
        assert_eq!(entry.bytes, bytes.len() as u64);
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(&bytes)));
        assert!(manifest.files[1].columns.contains(&"duration_ms".to_string()));
    }
}
