//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running one test command in a
//! sandbox:
//! - `ProcessRunner`: local process group with rlimits applied before exec
//! - `SandboxedRunner`: isolate boxes
//!
//! Runners report raw observations. A program that crashes, exits nonzero or
//! times out is a normal observation; only failures of the sandbox itself
//! come back as `SandboxError`.
//!
//! The runner module does NOT:
//! - Compare outputs or assign points
//! - Resolve where stdin comes from
//! - Know about feedback configs

pub mod process;
pub mod sandboxed;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::config::GraderConfig;
use crate::core::command::ResourceLimits;
use crate::error::SandboxError;

/// Resource limits for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock limit
    pub time_limit: Duration,
    /// Address-space limit in bytes
    pub virtual_memory_bytes: Option<u64>,
    pub block_process_spawn: bool,
    /// Bytes kept per output stream
    pub max_output_bytes: usize,
    /// Sandbox-wide physical memory ceiling
    pub physical_memory_mb: Option<u32>,
}

impl RunLimits {
    pub fn for_command(limits: &ResourceLimits, config: &GraderConfig) -> Self {
        Self {
            time_limit: Duration::from_secs(u64::from(limits.time_limit)),
            virtual_memory_bytes: limits.virtual_memory_bytes(),
            block_process_spawn: limits.block_process_spawn,
            max_output_bytes: config.max_recorded_output_length,
            physical_memory_mb: config.physical_memory_limit_mb,
        }
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::for_command(&ResourceLimits::default(), &GraderConfig::default())
    }
}

/// What the sandbox observed while running a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionObservation {
    /// Exit status; `-signal` if killed by a signal, `None` if timed out
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    /// Set when the sandbox ran but can't vouch for the result
    pub infra_failure: Option<String>,
}

impl ExecutionObservation {
    pub fn exited(return_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            return_code: Some(return_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            return_code: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn is_infra_failure(&self) -> bool {
        self.infra_failure.is_some()
    }
}

/// Sender half of an abort signal
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half of an abort signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the abort fires. Pending forever if it never can.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected abort handle and signal
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Runner trait for executing test commands
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `cmd` as `bash -c <cmd>` under `limits`, feeding `stdin` if given.
    async fn run(
        &self,
        cmd: &str,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        abort: &AbortSignal,
    ) -> Result<ExecutionObservation, SandboxError>;
}

/// Read a stream to the end, keeping at most `limit` bytes.
///
/// Keeps draining past the limit so the writer never blocks on a full pipe.
pub(crate) async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            kept.extend_from_slice(&chunk[..room]);
            truncated = true;
        } else {
            kept.extend_from_slice(&chunk[..n]);
        }
    }

    Ok((kept, truncated))
}

pub(crate) fn decode_output(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

// Re-exports
pub use process::ProcessRunner;
pub use sandboxed::SandboxedRunner;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_bounded_truncates_and_drains() {
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = read_bounded(&data[..], 100).await.unwrap();
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_bounded(&b"short"[..], 100).await.unwrap();
        assert_eq!(kept, b"short");
        assert!(!truncated);
    }

    #[test]
    fn test_run_limits_for_command() {
        let limits = ResourceLimits {
            time_limit: 3,
            use_virtual_memory_limit: true,
            virtual_memory_limit: 1024,
            block_process_spawn: true,
        };
        let config = GraderConfig {
            max_recorded_output_length: 77,
            physical_memory_limit_mb: None,
            ..GraderConfig::default()
        };

        let run = RunLimits::for_command(&limits, &config);
        assert_eq!(run.time_limit, Duration::from_secs(3));
        assert_eq!(run.virtual_memory_bytes, Some(1024));
        assert!(run.block_process_spawn);
        assert_eq!(run.max_output_bytes, 77);
        assert_eq!(run.physical_memory_mb, None);
    }

    #[tokio::test]
    async fn test_abort_signal() {
        let (handle, signal) = abort_pair();
        assert!(!signal.is_aborted());

        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.abort();
        task.await.unwrap();
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = AbortSignal::never();
        let result =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_aborted());
    }
}
