use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::PipelineOrchestrator;
use crate::PipelineError;

/// Scheduler that triggers one pipeline run per `cron` tick. Ticks that land
/// while a run still holds the lease are skipped.
pub async fn build_scheduler(orchestrator: Arc<PipelineOrchestrator>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match orchestrator.run_pipeline().await {
                Ok(summary) => info!(
                    run_id = %summary.run.run_id,
                    status = %summary.run.status,
                    "scheduled pipeline run finished"
                ),
                Err(PipelineError::AlreadyRunning { holder, expires_at }) => {
                    warn!(%holder, %expires_at, "scheduled run skipped; pipeline already running")
                }
                Err(err) => error!(error = %err, "scheduled pipeline run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<PipelineOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(orchestrator, &config.pipeline_cron).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSettings;
    use jbes_adapters::ScraperRegistry;
    use jbes_core::SystemClock;
    use jbes_storage::MemoryStore;

    fn orchestrator() -> Arc<PipelineOrchestrator> {
        Arc::new(PipelineOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            ScraperRegistry::new(),
            PipelineSettings::default(),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config, orchestrator()).await.unwrap().is_none());
    }

    #[test]
    fn pipeline_run_can_be_spawned_by_the_scheduler() {
        fn assert_send<T: Send>(_: &T) {}
        let orchestrator = orchestrator();
        let run = orchestrator.run_pipeline();
        assert_send(&run);
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let err = build_scheduler(orchestrator(), "not a cron").await.err().unwrap();
        assert!(err.to_string().contains("not a cron"));
    }
}
