use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use grader::cache::{RedisRenderCache, RedisResultStore, RenderCache, ResultStore};
use grader::config::{get_config, init_config, GraderConfig, SandboxBackend};
use grader::grader::Grader;
use grader::jobs::{
    process_command_updated_job, process_grade_job, process_invalidate_job, process_prune_job,
    GradingStatus, WorkerJob,
};
use grader::redis_manager::{RedisManager, StatusPublisher};
use grader::runner::{abort_pair, AbortSignal, ProcessRunner, Runner, SandboxedRunner};
use grader::sandbox::is_cgroups_available;
use grader::storage::StorageClient;

/// Shared state handed to every job task
#[derive(Clone)]
struct Worker {
    grader: Grader,
    store: Arc<dyn ResultStore>,
    renders: Arc<dyn RenderCache>,
    status: StatusPublisher,
    shutdown: AbortSignal,
}

impl Worker {
    async fn handle(&self, job: WorkerJob) {
        match job {
            WorkerJob::Grade(job) => {
                info!(
                    "Received grade job: submission_id={}, project_id={}, suites={}",
                    job.submission_id,
                    job.project_id,
                    job.suites.len()
                );
                self.publish(&GradingStatus::grading(&job)).await;

                let status = process_grade_job(
                    &self.grader,
                    &job,
                    self.store.as_ref(),
                    self.renders.as_ref(),
                    &self.shutdown,
                )
                .await;

                info!(
                    "Grade job completed: submission_id={}, status={:?}",
                    job.submission_id, status.status
                );
                self.publish(&status).await;
            }
            WorkerJob::PruneResults(job) => {
                if let Err(e) =
                    process_prune_job(&job, self.store.as_ref(), self.renders.as_ref()).await
                {
                    error!(
                        "Failed to prune {:?} in project {}: {:#}",
                        job.path, job.project_id, e
                    );
                }
            }
            WorkerJob::CommandUpdated(job) => {
                if let Err(e) =
                    process_command_updated_job(&job, self.store.as_ref(), self.renders.as_ref())
                        .await
                {
                    error!(
                        "Failed to drop stale results of command {:?} in project {}: {:#}",
                        job.path(),
                        job.project_id,
                        e
                    );
                }
            }
            WorkerJob::InvalidateResultsCache(job) => {
                if let Err(e) = process_invalidate_job(&job, self.renders.as_ref()).await {
                    error!(
                        "Failed to invalidate cached renders of project {}: {:#}",
                        job.project_id, e
                    );
                }
            }
        }
    }

    async fn publish(&self, status: &GradingStatus) {
        if let Err(e) = self.status.publish(status).await {
            error!(
                "Failed to publish status of submission {}: {:#}",
                status.submission_id, e
            );
        }
    }
}

async fn build_runner(config: &GraderConfig, worker_id: u32) -> Result<Arc<dyn Runner>> {
    match config.sandbox_backend {
        SandboxBackend::Process => {
            let runner = ProcessRunner::new()
                .with_unprivileged_identity(config.sandbox_uid, config.sandbox_gid);
            if !runner.can_block_spawn() {
                anyhow::bail!(
                    "process backend running as root needs a non-root GRADER_SANDBOX_UID to block process spawning"
                );
            }
            warn!(
                "Using the local process sandbox; spawn-blocked commands run as uid {}",
                config.sandbox_uid
            );
            Ok(Arc::new(runner))
        }
        SandboxBackend::Isolate => {
            // Fail fast: the physical memory ceiling depends on cgroups
            if !is_cgroups_available().await {
                anyhow::bail!("isolate backend selected but cgroup support is unavailable");
            }
            info!("Confirmed isolate cgroup support is available");
            Ok(Arc::new(SandboxedRunner::new(
                worker_id,
                true,
                config.max_process_count,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    init_config(GraderConfig::from_env().context("Failed to load grader configuration")?)?;
    let config = get_config();
    info!(
        "Grader config: backend={:?}, max_time_limit={}s, max_output={} bytes, concurrency={}",
        config.sandbox_backend,
        config.max_time_limit_secs,
        config.max_recorded_output_length,
        config.max_concurrent_jobs
    );

    info!("Starting Grader Worker...");

    let mut redis_manager = RedisManager::from_env().await?;
    let shared_conn = redis_manager.connection_manager().await?;

    let storage = StorageClient::from_env().await?;
    info!("Connected to MinIO storage");

    let runner = build_runner(config, redis_manager.worker_id()).await?;
    let (shutdown_handle, shutdown) = abort_pair();

    let worker = Worker {
        grader: Grader::new(runner, Arc::new(storage)),
        store: Arc::new(RedisResultStore::new(shared_conn.clone())),
        renders: Arc::new(RedisRenderCache::new(shared_conn.clone())),
        status: StatusPublisher::new(shared_conn),
        shutdown,
    };

    let permits = config.max_concurrent_jobs.max(1);
    let slots = Arc::new(Semaphore::new(permits));

    info!("Waiting for jobs...");

    loop {
        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .context("Job semaphore closed")?;

        let job = tokio::select! {
            job = redis_manager.pop_job() => job?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, aborting in-flight jobs");
                break;
            }
        };

        let worker = worker.clone();
        tokio::spawn(async move {
            worker.handle(job).await;
            drop(permit);
        });
    }

    shutdown_handle.abort();
    let permits = u32::try_from(permits).unwrap_or(u32::MAX);
    let _ = slots.acquire_many(permits).await;
    info!("All jobs stopped");

    Ok(())
}
