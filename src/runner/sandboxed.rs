//! Sandboxed runner implementation using isolate
//!
//! Each command gets a fresh box. Box ids are partitioned per worker so
//! workers on one host never collide.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::warn;

use super::{decode_output, AbortSignal, ExecutionObservation, RunLimits, Runner};
use crate::error::SandboxError;
use crate::sandbox::{IoSpec, IsolateBox, IsolateStatus, Limits, SandboxOutcome};

const STDIN_FILE: &str = "stdin.txt";

/// Isolate only supports box ids 0-9999; each worker (0-9) gets 1000 of them.
pub fn calculate_box_id(worker_id: u32, counter: u32) -> u32 {
    (worker_id % 10) * 1000 + counter % 1000
}

/// Runner that executes commands in isolate boxes
pub struct SandboxedRunner {
    worker_id: u32,
    use_cgroups: bool,
    /// Process cap when spawning is allowed
    max_processes: u32,
    /// Files copied into every box
    work_dir: Option<PathBuf>,
    counter: AtomicU32,
}

impl SandboxedRunner {
    pub fn new(worker_id: u32, use_cgroups: bool, max_processes: u32) -> Self {
        Self {
            worker_id,
            use_cgroups,
            max_processes,
            work_dir: None,
            counter: AtomicU32::new(0),
        }
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn next_box_id(&self) -> u32 {
        calculate_box_id(self.worker_id, self.counter.fetch_add(1, Ordering::Relaxed))
    }

    fn box_limits(&self, limits: &RunLimits) -> Limits {
        Limits {
            wall_time: limits.time_limit,
            address_space_kb: limits.virtual_memory_bytes.map(|b| b.div_ceil(1024)),
            cg_mem_kb: limits.physical_memory_mb.map(|mb| u64::from(mb) * 1024),
            processes: if limits.block_process_spawn {
                1
            } else {
                self.max_processes
            },
            ..Limits::default()
        }
    }

    async fn run_in_box(
        &self,
        isolate_box: &IsolateBox,
        cmd: &str,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        abort: &AbortSignal,
    ) -> Result<SandboxOutcome, SandboxError> {
        if let Some(dir) = &self.work_dir {
            isolate_box.copy_dir_in(dir).await?;
        }

        let mut io = IoSpec::default();
        if let Some(data) = stdin {
            isolate_box.write_file(STDIN_FILE, data).await?;
            io = io.with_stdin(STDIN_FILE);
        }

        let command = vec!["/bin/bash".to_string(), "-c".to_string(), cmd.to_string()];
        isolate_box
            .run(
                &command,
                &self.box_limits(limits),
                &io,
                limits.max_output_bytes,
                abort,
            )
            .await
    }
}

/// Translate isolate's report into an observation
pub fn observation_from_outcome(outcome: SandboxOutcome) -> ExecutionObservation {
    let mut observation = ExecutionObservation {
        return_code: None,
        stdout: decode_output(&outcome.stdout),
        stderr: decode_output(&outcome.stderr),
        stdout_truncated: outcome.stdout_truncated,
        stderr_truncated: outcome.stderr_truncated,
        timed_out: false,
        infra_failure: None,
    };

    match outcome.meta.status {
        IsolateStatus::Exited => observation.return_code = Some(outcome.meta.exit_code),
        IsolateStatus::Signal(sig) => observation.return_code = Some(-sig),
        IsolateStatus::TimeOut => observation.timed_out = true,
        IsolateStatus::InternalError => {
            observation.infra_failure = Some(
                outcome
                    .meta
                    .message
                    .unwrap_or_else(|| "isolate internal error".to_string()),
            );
        }
    }

    observation
}

#[async_trait]
impl Runner for SandboxedRunner {
    async fn run(
        &self,
        cmd: &str,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        abort: &AbortSignal,
    ) -> Result<ExecutionObservation, SandboxError> {
        if abort.is_aborted() {
            return Err(SandboxError::Aborted);
        }

        let isolate_box = IsolateBox::new(self.next_box_id(), self.use_cgroups).await?;
        let result = self.run_in_box(&isolate_box, cmd, limits, stdin, abort).await;

        let box_id = isolate_box.box_id();
        if let Err(e) = isolate_box.cleanup().await {
            warn!("Failed to clean up isolate box {}: {}", box_id, e);
        }

        result.map(observation_from_outcome)
    }
}
