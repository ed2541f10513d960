//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles the worker's own Redis traffic:
//! - Worker ID allocation and lease management
//! - Job queue operations (BLPOP)
//! - Grading status storage and publishing
//!
//! Result aggregates and rendered documents live in `cache::redis_store`.
//! They, and status publishing, run on auto-reconnecting connection managers
//! so they can be shared across concurrent jobs.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::jobs::{GradingStatus, WorkerJob};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "grader:worker:lease:";

    /// Job queue key
    pub const GRADE_QUEUE: &str = "grader:queue";

    /// Grading status key prefix (for polling)
    pub const STATUS_PREFIX: &str = "grader:status:";

    /// Grading status channel (for pub/sub)
    pub const STATUS_CHANNEL: &str = "grader:status";
}

/// Configuration constants
const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;
const STATUS_EXPIRY_SECS: u64 = 3600;

pub fn status_key(submission_id: i64) -> String {
    format!("{}{}", keys::STATUS_PREFIX, submission_id)
}

fn worker_lease_key(worker_id: u32) -> String {
    format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id)
}

/// Decode one queue entry. Malformed entries are logged and skipped.
pub fn parse_job(data: &str) -> Option<WorkerJob> {
    match serde_json::from_str::<WorkerJob>(data) {
        Ok(job) => Some(job),
        Err(e) => {
            warn!("Failed to parse job data: {}. Data: {}", e, data);
            None
        }
    }
}

/// Centralized Redis manager for the worker
pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    conn: MultiplexedConnection,
    lease_handle: JoinHandle<()>,
}

impl RedisManager {
    /// Connect, claim a worker ID and keep its lease alive in the background.
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = allocate_worker_id(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );

        let lease_handle = spawn_lease_heartbeat(client.clone(), worker_id);

        Ok(Self {
            worker_id,
            client,
            conn,
            lease_handle,
        })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// A reconnecting connection for work shared across jobs
    pub async fn connection_manager(&self) -> Result<ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .context("Failed to create Redis connection manager")
    }

    /// Block until the next well-formed job arrives.
    ///
    /// Reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<WorkerJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::GRADE_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some(job) = result.and_then(|(_, data)| parse_job(&data)) {
                return Ok(job);
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

/// Stores grading status for polling and publishes it. Cheap to clone.
#[derive(Clone)]
pub struct StatusPublisher {
    conn: ConnectionManager,
}

impl StatusPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn publish(&self, status: &GradingStatus) -> Result<()> {
        let key = status_key(status.submission_id);
        let json = serde_json::to_string(status)?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, &json, STATUS_EXPIRY_SECS)
            .await
            .with_context(|| format!("Failed to store status {}", key))?;

        // No subscribers is fine
        let _ = conn
            .publish::<_, _, ()>(keys::STATUS_CHANNEL, &json)
            .await;

        Ok(())
    }
}

/// Get a Redis connection, retrying every 3 seconds
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Claim the lowest free worker ID with SET NX EX
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await?;

        for worker_id in 0..MAX_WORKERS {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(worker_lease_key(worker_id))
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Refresh the worker lease at half its TTL
fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);

        loop {
            tokio::time::sleep(interval).await;

            match get_connection_with_retry(&client).await {
                Ok(mut conn) => {
                    if let Err(e) = redis::cmd("EXPIRE")
                        .arg(worker_lease_key(worker_id))
                        .arg(WORKER_LEASE_TTL_SECS)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("Failed to refresh worker lease {}: {}", worker_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh worker lease {} (connection): {}",
                        worker_id, e
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(status_key(42), "grader:status:42");
        assert_eq!(worker_lease_key(3), "grader:worker:lease:3");
    }

    #[test]
    fn test_parse_job_skips_garbage() {
        assert!(parse_job("not json").is_none());
        assert!(parse_job(r#"{"job_type": "compile"}"#).is_none());
        assert!(matches!(
            parse_job(r#"{"job_type": "invalidate_results_cache", "project_id": 1}"#),
            Some(WorkerJob::InvalidateResultsCache(_))
        ));
    }
}
