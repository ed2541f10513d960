//! Error types shared across the grading engine
//!
//! Library-facing failures are typed so callers can tell an instructor
//! misconfiguration apart from sandbox trouble or an aborted run. Glue code
//! (worker loop, Redis, object storage) keeps using `anyhow`.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::core::feedback::FeedbackCategory;

/// Field-level validation errors for a command definition.
///
/// Keys are field names, values are human-readable messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationError {
    pub field_errors: BTreeMap<String, String>,
}

impl ConfigurationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error for `field`. The first message recorded for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.field_errors
            .entry(field.into())
            .or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.field_errors.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.field_errors.contains_key(field)
    }

    /// `Ok(())` when no field errors were recorded.
    pub fn into_result(self) -> Result<(), ConfigurationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid command configuration")?;
        for (i, (field, message)) in self.field_errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, field, message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigurationError {}

/// Failures of the sandbox itself, never of the program under test.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    #[error("sandbox could not report a reliable result: {0}")]
    Infra(String),

    #[error("execution aborted")]
    Aborted,

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the grading pipeline.
#[derive(Debug, Error)]
pub enum GradeError {
    /// The command could not be executed reliably; nothing was scored.
    #[error("infrastructure failure while running command {command_id}: {source}")]
    InfraFailure {
        command_id: i64,
        #[source]
        source: SandboxError,
    },

    #[error("grading aborted")]
    Aborted,

    #[error("instructor file unavailable: {0:#}")]
    FileUnavailable(anyhow::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Rendering was attempted with a tier that has no config. This is a bug
    /// in the caller, not a recoverable condition.
    #[error("no feedback config for category {0}")]
    MissingFeedbackConfig(FeedbackCategory),

    #[error("result cache error: {0:#}")]
    Cache(anyhow::Error),
}

impl GradeError {
    /// Lift a sandbox error for `command_id`, keeping aborts distinguishable.
    pub fn from_sandbox(command_id: i64, err: SandboxError) -> Self {
        match err {
            SandboxError::Aborted => GradeError::Aborted,
            other => GradeError::InfraFailure {
                command_id,
                source: other,
            },
        }
    }
}
