//! Grader configuration
//!
//! Engine-wide limits and backend selection. Values come from an optional
//! TOML file (named by `GRADER_CONFIG`) and are then overridden by
//! environment variables. The resolved config is installed once per process.

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which sandbox backend executes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// Local process group with rlimits applied before exec
    #[default]
    Process,
    /// isolate boxes (requires the isolate binary)
    Isolate,
}

impl FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(SandboxBackend::Process),
            "isolate" => Ok(SandboxBackend::Isolate),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Time limit applied to commands that don't set one (seconds)
    pub default_time_limit_secs: u32,
    /// Upper bound accepted for a command's time limit (seconds)
    pub max_time_limit_secs: u32,
    /// Virtual memory limit used when a command enables the limit without a value (bytes)
    pub default_virtual_memory_limit: u64,
    /// Captured stdout/stderr beyond this many bytes is dropped
    pub max_recorded_output_length: usize,
    /// Sandbox-wide physical memory ceiling, independent of per-command limits
    pub physical_memory_limit_mb: Option<u32>,
    /// Process cap when spawning is allowed (isolate backend)
    pub max_process_count: u32,
    pub sandbox_backend: SandboxBackend,
    /// Identity a root worker drops to for spawn-blocked commands (process backend)
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// Number of submissions a worker grades at once
    pub max_concurrent_jobs: usize,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            default_time_limit_secs: 10,
            max_time_limit_secs: 90,
            default_virtual_memory_limit: 500_000_000,
            max_recorded_output_length: 8_000_000,
            physical_memory_limit_mb: Some(4096),
            max_process_count: 150,
            sandbox_backend: SandboxBackend::Process,
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            max_concurrent_jobs: 4,
        }
    }
}

impl GraderConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse grader config")
    }

    /// Load a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read grader config: {:?}", path))?;
        Self::from_toml_str(&content)
    }

    /// Load from `GRADER_CONFIG` (if set), then apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("GRADER_CONFIG") {
            Ok(path) => {
                info!("Loading grader config from {}", path);
                Self::from_file(&path)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, value, e))
        }

        if let Some(v) = lookup("GRADER_DEFAULT_TIME_LIMIT") {
            self.default_time_limit_secs = parse("GRADER_DEFAULT_TIME_LIMIT", &v)?;
        }
        if let Some(v) = lookup("GRADER_MAX_TIME_LIMIT") {
            self.max_time_limit_secs = parse("GRADER_MAX_TIME_LIMIT", &v)?;
        }
        if let Some(v) = lookup("GRADER_DEFAULT_VIRTUAL_MEMORY_LIMIT") {
            self.default_virtual_memory_limit = parse("GRADER_DEFAULT_VIRTUAL_MEMORY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("GRADER_MAX_OUTPUT_LENGTH") {
            self.max_recorded_output_length = parse("GRADER_MAX_OUTPUT_LENGTH", &v)?;
        }
        if let Some(v) = lookup("GRADER_PHYSICAL_MEMORY_LIMIT_MB") {
            // 0 disables the ceiling
            let mb: u32 = parse("GRADER_PHYSICAL_MEMORY_LIMIT_MB", &v)?;
            self.physical_memory_limit_mb = (mb > 0).then_some(mb);
        }
        if let Some(v) = lookup("GRADER_MAX_PROCESSES") {
            self.max_process_count = parse("GRADER_MAX_PROCESSES", &v)?;
        }
        if let Some(v) = lookup("GRADER_SANDBOX_BACKEND") {
            self.sandbox_backend = v.parse()?;
        }
        if let Some(v) = lookup("GRADER_SANDBOX_UID") {
            self.sandbox_uid = parse("GRADER_SANDBOX_UID", &v)?;
        }
        if let Some(v) = lookup("GRADER_SANDBOX_GID") {
            self.sandbox_gid = parse("GRADER_SANDBOX_GID", &v)?;
        }
        if let Some(v) = lookup("GRADER_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = parse("GRADER_MAX_CONCURRENT_JOBS", &v)?;
        }

        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.max_time_limit_secs == 0 {
            anyhow::bail!("max_time_limit_secs must be at least 1");
        }
        if self.default_time_limit_secs == 0
            || self.default_time_limit_secs > self.max_time_limit_secs
        {
            anyhow::bail!(
                "default_time_limit_secs must be within 1..={}",
                self.max_time_limit_secs
            );
        }
        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }
        Ok(())
    }
}

/// Global grader configuration
static GRADER_CONFIG: OnceLock<GraderConfig> = OnceLock::new();

/// Install the process-wide configuration. Fails if called twice.
pub fn init_config(config: GraderConfig) -> Result<()> {
    GRADER_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Grader configuration already initialized"))
}

/// Get the process-wide configuration, falling back to defaults.
pub fn get_config() -> &'static GraderConfig {
    GRADER_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<GraderConfig> = OnceLock::new();

        warn!("Grader configuration not initialized, using default");
        DEFAULT.get_or_init(GraderConfig::default)
    })
}
