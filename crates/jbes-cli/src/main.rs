use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jbes_core::BoardId;
use jbes_storage::{PgStore, RecordStore};
use jbes_sync::scheduler::build_scheduler;
use jbes_sync::{build_orchestrator, BoardsFile, PipelineOrchestrator, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jbes-cli")]
#[command(about = "Job board efficiency scoring pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run,
    /// Run the pipeline on a cron schedule until interrupted.
    Schedule {
        /// Overrides JBES_PIPELINE_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    Migrate,
    /// Upsert boards named in the boards file.
    RegisterBoards,
    /// Recompute stored lifespans for every posting.
    RepairLifespans,
    Scores,
    Trends {
        board_id: BoardId,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    Anomalies {
        board_id: BoardId,
    },
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

async fn connect(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.max_concurrent_boards as u32 + 1)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn orchestrator(config: &SyncConfig) -> Result<PipelineOrchestrator> {
    let store = connect(config).await?;
    build_orchestrator(config, store).await
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = orchestrator(&config).await?.run_pipeline().await?;
            println!(
                "run complete: run_id={} status={} jobs={} failed={} scored={}",
                summary.run.run_id,
                summary.run.status,
                summary.run.total_jobs,
                summary.run.failed_jobs,
                summary.scores.len()
            );
            for error in &summary.run.errors {
                println!("  error: {error}");
            }
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {}", dir.display());
            }
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.pipeline_cron.clone());
            let orchestrator = Arc::new(orchestrator(&config).await?);
            let mut sched = build_scheduler(orchestrator, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::RegisterBoards => {
            let store = connect(&config).await?;
            let boards = BoardsFile::load(&config.boards_file).await?.boards();
            for board in &boards {
                store
                    .upsert_board(board)
                    .await
                    .with_context(|| format!("registering board {}", board.id))?;
            }
            println!("registered {} boards", boards.len());
        }
        Commands::RepairLifespans => {
            let batch = orchestrator(&config)
                .await?
                .lifecycle()
                .bulk_update_all_lifespans()
                .await?;
            println!(
                "lifespans repaired: updated={} skipped={} failed={}",
                batch.updated, batch.skipped, batch.failed
            );
        }
        Commands::Scores => {
            let orchestrator = orchestrator(&config).await?;
            let names: std::collections::HashMap<BoardId, String> = orchestrator
                .store()
                .list_boards()
                .await?
                .into_iter()
                .map(|b| (b.id, b.name))
                .collect();
            let ranked = orchestrator.latest_ranked_scores().await?;
            for r in ranked {
                println!(
                    "{:>3}. {:<30} {:>3} {:<2} p{}",
                    r.rank,
                    names.get(&r.score.board_id).map(String::as_str).unwrap_or("?"),
                    r.score.overall_score,
                    r.grade.as_str(),
                    r.score.percentile.unwrap_or(0)
                );
            }
        }
        Commands::Trends { board_id, days } => {
            let trends = orchestrator(&config).await?.trends();
            print_json(&serde_json::json!({
                "trend": trends.board_trend(board_id, days).await?,
                "weekly": trends.weekly_comparison(board_id).await?,
            }))?;
        }
        Commands::Anomalies { board_id } => {
            let alerts = orchestrator(&config).await?.trends().detect_anomalies(board_id).await?;
            print_json(&alerts)?;
        }
        Commands::Runs { limit, days } => {
            let orchestrator = orchestrator(&config).await?;
            print_json(&serde_json::json!({
                "runs": orchestrator.run_history(limit).await?,
                "stats": orchestrator.pipeline_stats(days).await?,
            }))?;
        }
    }

    Ok(())
}
