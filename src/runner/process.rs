//! Local process runner
//!
//! Runs each command as `bash -c <cmd>` in its own process group. Resource
//! limits are installed with `setrlimit` between fork and exec. On timeout or
//! abort the whole group is killed, so children of the command die with it.
//!
//! Spawn blocking relies on `RLIMIT_NPROC`, which the kernel ignores for
//! root. A root worker therefore runs spawn-blocked commands under an
//! unprivileged uid/gid, and refuses to run them at all if that identity is
//! root too.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{geteuid, Pid};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{decode_output, read_bounded, AbortSignal, ExecutionObservation, RunLimits, Runner};
use crate::error::SandboxError;

/// How long to wait for output pipes to close after the process group is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// `nobody` on most distributions
pub const DEFAULT_UNPRIVILEGED_ID: u32 = 65534;

/// rlimits applied in the child before exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    address_space: Option<u64>,
    data_segment: Option<u64>,
    block_spawn: bool,
}

impl ChildLimits {
    fn from_run_limits(limits: &RunLimits) -> Self {
        Self {
            address_space: limits.virtual_memory_bytes,
            data_segment: limits
                .physical_memory_mb
                .map(|mb| u64::from(mb) * 1024 * 1024),
            block_spawn: limits.block_process_spawn,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(bytes) = self.data_segment {
            setrlimit(Resource::RLIMIT_DATA, bytes, bytes)?;
        }
        if self.block_spawn {
            setrlimit(Resource::RLIMIT_NPROC, 0, 0)?;
        }
        Ok(())
    }
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Aborted,
}

/// Runner that executes commands as local process groups
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    work_dir: Option<PathBuf>,
    /// uid/gid for spawn-blocked commands when the worker is root
    unprivileged_uid: u32,
    unprivileged_gid: u32,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            work_dir: None,
            unprivileged_uid: DEFAULT_UNPRIVILEGED_ID,
            unprivileged_gid: DEFAULT_UNPRIVILEGED_ID,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from `dir` instead of the worker's current directory.
    /// Spawn-blocked commands of a root worker need the unprivileged identity
    /// to be able to enter it.
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_unprivileged_identity(mut self, uid: u32, gid: u32) -> Self {
        self.unprivileged_uid = uid;
        self.unprivileged_gid = gid;
        self
    }

    /// Whether spawn blocking can be enforced for the current worker
    pub fn can_block_spawn(&self) -> bool {
        !geteuid().is_root() || self.unprivileged_uid != 0
    }
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let Ok(pid) = i32::try_from(pid) else { return };
    // ESRCH just means the group is already gone
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            warn!("Failed to kill process group {}: {}", pid, e);
        }
    }
}

async fn collect(
    task: JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
    stream: &str,
) -> Result<(String, bool), SandboxError> {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok((data, truncated)))) => Ok((decode_output(&data), truncated)),
        Ok(Ok(Err(e))) => Err(SandboxError::Io(e)),
        Ok(Err(e)) => Err(SandboxError::Infra(format!("{} reader failed: {}", stream, e))),
        Err(_) => Err(SandboxError::Infra(format!(
            "{} stayed open after the process group was killed",
            stream
        ))),
    }
}

#[async_trait]
impl Runner for ProcessRunner {
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

        debug!("Running command: bash -c {:?}", cmd);

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }

        if limits.block_process_spawn && geteuid().is_root() {
            if self.unprivileged_uid == 0 {
                return Err(SandboxError::Provisioning(
                    "cannot block process spawning: worker and sandbox identity are both root"
                        .into(),
                ));
            }
            // applied before the pre_exec hook, so RLIMIT_NPROC binds the new uid
            command.uid(self.unprivileged_uid).gid(self.unprivileged_gid);
        }

        let child_limits = ChildLimits::from_run_limits(limits);
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe,
        // and does not allocate or take locks.
        unsafe {
            command.pre_exec(move || child_limits.apply());
        }

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Provisioning(format!("failed to spawn bash: {}", e)))?;
        let pid = child.id();

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Provisioning("stdout was not captured".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Provisioning("stderr was not captured".into()))?;
        let stdout_task = tokio::spawn(read_bounded(stdout_pipe, limits.max_output_bytes));
        let stderr_task = tokio::spawn(read_bounded(stderr_pipe, limits.max_output_bytes));

        let stdin_task = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(tokio::spawn(async move {
                    // the program may exit without reading everything
                    let _ = pipe.write_all(&data).await;
                    let _ = pipe.shutdown().await;
                }))
            }
            _ => None,
        };

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            _ = tokio::time::sleep(limits.time_limit) => Ending::TimedOut,
            _ = abort.cancelled() => Ending::Aborted,
        };

        // Also reaps anything the command left running in the background
        kill_group(pid);
        if !matches!(ending, Ending::Exited(_)) {
            let _ = child.wait().await;
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        let (stdout, stdout_truncated) = collect(stdout_task, "stdout").await?;
        let (stderr, stderr_truncated) = collect(stderr_task, "stderr").await?;

        let mut observation = ExecutionObservation {
            return_code: None,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out: false,
            infra_failure: None,
        };

        match ending {
            Ending::Aborted => return Err(SandboxError::Aborted),
            Ending::TimedOut => observation.timed_out = true,
            Ending::Exited(status) => {
                observation.return_code = match (status.code(), status.signal()) {
                    (Some(code), _) => Some(code),
                    (None, Some(signal)) => Some(-signal),
                    (None, None) => {
                        observation.infra_failure =
                            Some(format!("unrecognized exit status: {:?}", status));
                        None
                    }
                };
            }
        }

        debug!(
            "Command finished: return_code={:?}, timed_out={}, stdout_truncated={}, stderr_truncated={}",
            observation.return_code,
            observation.timed_out,
            observation.stdout_truncated,
            observation.stderr_truncated
        );

        Ok(observation)
    }
}
