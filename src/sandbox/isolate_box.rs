//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox. Manages box initialization,
//! cleanup, and running one command with its output captured to files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::meta::{parse_meta, IsolateMeta};
use crate::error::SandboxError;
use crate::runner::{read_bounded, AbortSignal};

/// Cached cgroup availability
static USE_CGROUPS: OnceLock<bool> = OnceLock::new();

/// Check if isolate cgroups are available
pub async fn is_cgroups_available() -> bool {
    if let Some(value) = USE_CGROUPS.get() {
        return *value;
    }

    let check = Command::new("isolate")
        .args(["--box-id", "9999", "--cg", "--init"])
        .output()
        .await;

    let _ = Command::new("isolate")
        .args(["--box-id", "9999", "--cg", "--cleanup"])
        .output()
        .await;

    let available = matches!(check, Ok(r) if r.status.success());
    let _ = USE_CGROUPS.set(available);
    available
}

/// File names used inside the box
#[derive(Debug, Clone)]
pub struct IoSpec {
    pub stdin_file: Option<String>,
    pub stdout_file: String,
    pub stderr_file: String,
}

impl Default for IoSpec {
    fn default() -> Self {
        Self {
            stdin_file: None,
            stdout_file: "stdout.txt".to_string(),
            stderr_file: "stderr.txt".to_string(),
        }
    }
}

impl IoSpec {
    pub fn with_stdin(mut self, name: impl Into<String>) -> Self {
        self.stdin_file = Some(name.into());
        self
    }
}

/// Resource limits passed to isolate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub wall_time: Duration,
    /// Address-space limit in KB (`--mem`)
    pub address_space_kb: Option<u64>,
    /// Control-group memory ceiling in KB (`--cg-mem`), only with cgroups
    pub cg_mem_kb: Option<u64>,
    pub processes: u32,
    pub open_files: u32,
    pub fsize_kb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_secs(10),
            address_space_kb: None,
            cg_mem_kb: None,
            processes: 64,
            open_files: 256,
            fsize_kb: 1024 * 1024,
        }
    }
}

/// Raw outcome from sandbox execution
#[derive(Debug)]
pub struct SandboxOutcome {
    pub meta: IsolateMeta,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Build the isolate `--run` argument list.
pub fn build_run_args(
    box_id: u32,
    use_cgroups: bool,
    meta_file: &Path,
    limits: &Limits,
    io: &IoSpec,
    command: &[String],
) -> Vec<String> {
    let mut args = vec!["--box-id".to_string(), box_id.to_string()];

    if use_cgroups {
        args.push("--cg".to_string());
        if let Some(kb) = limits.cg_mem_kb {
            args.push(format!("--cg-mem={}", kb));
        }
    }
    if let Some(kb) = limits.address_space_kb {
        args.push(format!("--mem={}", kb));
    }

    args.extend([
        format!("--wall-time={}", limits.wall_time.as_secs_f64()),
        format!("--meta={}", meta_file.display()),
        format!("--stdout={}", io.stdout_file),
        format!("--stderr={}", io.stderr_file),
        format!("--processes={}", limits.processes),
        format!("--open-files={}", limits.open_files),
        format!("--fsize={}", limits.fsize_kb),
        "--dir=/usr".to_string(),
        "--dir=/lib".to_string(),
        "--dir=/lib64:maybe".to_string(),
        "--dir=/bin".to_string(),
        "--dir=/etc:noexec".to_string(),
        "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
        "--env=HOME=/box".to_string(),
    ]);

    if let Some(stdin) = &io.stdin_file {
        args.push(format!("--stdin={}", stdin));
    }

    args.push("--run".to_string());
    args.push("--".to_string());
    args.extend(command.iter().cloned());
    args
}

/// Isolate box manager
pub struct IsolateBox {
    box_id: u32,
    box_path: PathBuf,
    use_cgroups: bool,
}

impl IsolateBox {
    /// Create and initialize a new isolate box
    pub async fn new(box_id: u32, use_cgroups: bool) -> Result<Self, SandboxError> {
        let box_id_str = box_id.to_string();

        // Clean up anything left by a crashed run
        let mut cleanup_args = vec!["--box-id", box_id_str.as_str()];
        if use_cgroups {
            cleanup_args.push("--cg");
        }
        cleanup_args.push("--cleanup");
        let _ = Command::new("isolate").args(&cleanup_args).output().await;

        let mut args = vec!["--box-id", box_id_str.as_str()];
        if use_cgroups {
            args.push("--cg");
        }
        args.push("--init");

        let output = Command::new("isolate")
            .args(&args)
            .output()
            .await
            .map_err(|e| SandboxError::Provisioning(format!("failed to run isolate --init: {}", e)))?;

        if !output.status.success() {
            return Err(SandboxError::Provisioning(format!(
                "failed to initialize isolate box {}: {}",
                box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        info!(
            "Initialized isolate box {} at {:?} (cgroups: {})",
            box_id, box_path, use_cgroups
        );

        Ok(Self {
            box_id,
            box_path,
            use_cgroups,
        })
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Working directory of the boxed program
    pub fn work_dir(&self) -> PathBuf {
        self.box_path.join("box")
    }

    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), SandboxError> {
        fs::write(self.work_dir().join(name), data).await?;
        Ok(())
    }

    /// Copy a directory's regular files into the box's working directory
    pub async fn copy_dir_in(&self, source_dir: &Path) -> Result<(), SandboxError> {
        let mut entries = fs::read_dir(source_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::copy(entry.path(), self.work_dir().join(entry.file_name())).await?;
            }
        }
        Ok(())
    }

    /// Run a command in the box, keeping at most `max_output_bytes` per stream
    pub async fn run(
        &self,
        command: &[String],
        limits: &Limits,
        io: &IoSpec,
        max_output_bytes: usize,
        abort: &AbortSignal,
    ) -> Result<SandboxOutcome, SandboxError> {
        let meta_file = std::env::temp_dir().join(format!("isolate_meta_{}.txt", self.box_id));
        let args = build_run_args(self.box_id, self.use_cgroups, &meta_file, limits, io, command);

        debug!("Running isolate with args: {:?}", args);

        let mut child = Command::new("isolate")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Provisioning(format!("failed to run isolate: {}", e)))?;

        tokio::select! {
            status = child.wait() => {
                status?;
            }
            _ = abort.cancelled() => {
                let _ = child.kill().await;
                let _ = fs::remove_file(&meta_file).await;
                return Err(SandboxError::Aborted);
            }
        }

        let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
        let _ = fs::remove_file(&meta_file).await;
        let meta = parse_meta(&meta_content);

        let (stdout, stdout_truncated) = self.read_output(&io.stdout_file, max_output_bytes).await;
        let (stderr, stderr_truncated) = self.read_output(&io.stderr_file, max_output_bytes).await;

        Ok(SandboxOutcome {
            meta,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
        })
    }

    async fn read_output(&self, name: &str, limit: usize) -> (Vec<u8>, bool) {
        let path = self.work_dir().join(name);
        match fs::File::open(&path).await {
            Ok(file) => read_bounded(file, limit).await.unwrap_or_else(|e| {
                warn!("Failed to read {:?}: {}", path, e);
                (Vec::new(), false)
            }),
            // the program may never have produced the file
            Err(_) => (Vec::new(), false),
        }
    }

    /// Cleanup the isolate box
    pub async fn cleanup(self) -> Result<(), SandboxError> {
        let box_id = self.box_id.to_string();
        let mut args = vec!["--box-id", box_id.as_str()];
        if self.use_cgroups {
            args.push("--cg");
        }
        args.push("--cleanup");

        Command::new("isolate").args(&args).output().await?;
        info!("Cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}
