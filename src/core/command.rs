//! Test command definitions
//!
//! A `CommandSpec` is what an instructor configures: the shell command, where
//! its stdin comes from, what its outputs are checked against, resource
//! limits, point values and the feedback configs for every tier.
//!
//! The serialized form is versioned. Every field except `id` and `cmd` has a
//! default, so older documents keep deserializing as fields are added.

use serde::{Deserialize, Serialize};

use super::feedback::FeedbackConfigs;
use crate::checker::CompareOptions;

/// Current serialized layout of `CommandSpec`
pub const COMMAND_SCHEMA_VERSION: u32 = 1;

/// Longest expected-output text an instructor may type in directly
pub const MAX_EXPECTED_OUTPUT_TEXT_LENGTH: usize = 8_000_000;

pub const DEFAULT_TIME_LIMIT_SECS: u32 = 10;
pub const DEFAULT_VIRTUAL_MEMORY_LIMIT: u64 = 500_000_000;

fn current_schema_version() -> u32 {
    COMMAND_SCHEMA_VERSION
}

/// Reference to an instructor-uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Project that owns the file
    pub project_id: i64,
    pub name: String,
}

impl FileRef {
    pub fn new(project_id: i64, name: impl Into<String>) -> Self {
        Self {
            project_id,
            name: name.into(),
        }
    }
}

/// Where a command's stdin comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinSource {
    #[default]
    None,
    Text,
    InstructorFile,
    /// stdout of the command that ran before this one
    UpstreamStdout,
    /// stderr of the command that ran before this one
    UpstreamStderr,
}

/// Where an expected output comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutputSource {
    /// The stream is not checked
    #[default]
    None,
    Text,
    InstructorFile,
}

/// Expected value for one output stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectedOutput {
    pub source: ExpectedOutputSource,
    pub text: String,
    pub instructor_file: Option<FileRef>,
}

impl ExpectedOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            source: ExpectedOutputSource::Text,
            text: text.into(),
            instructor_file: None,
        }
    }

    pub fn file(file: FileRef) -> Self {
        Self {
            source: ExpectedOutputSource::InstructorFile,
            text: String::new(),
            instructor_file: Some(file),
        }
    }

    pub fn is_checked(&self) -> bool {
        self.source != ExpectedOutputSource::None
    }
}

/// Expected exit status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReturnCode {
    #[default]
    None,
    Zero,
    Nonzero,
    Exact(i32),
}

impl ExpectedReturnCode {
    pub fn is_checked(&self) -> bool {
        !matches!(self, ExpectedReturnCode::None)
    }
}

/// Per-command resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock limit in seconds
    pub time_limit: u32,
    pub use_virtual_memory_limit: bool,
    /// Address-space limit in bytes, applied when `use_virtual_memory_limit` is set
    pub virtual_memory_limit: u64,
    pub block_process_spawn: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit: DEFAULT_TIME_LIMIT_SECS,
            use_virtual_memory_limit: false,
            virtual_memory_limit: DEFAULT_VIRTUAL_MEMORY_LIMIT,
            block_process_spawn: false,
        }
    }
}

impl ResourceLimits {
    /// The address-space limit to enforce, if any
    pub fn virtual_memory_bytes(&self) -> Option<u64> {
        self.use_virtual_memory_limit
            .then_some(self.virtual_memory_limit)
    }
}

/// Point values per graded aspect. Awards are non-negative, deductions
/// non-positive; validation enforces both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PointValues {
    pub points_for_correct_return_code: i32,
    pub points_for_correct_stdout: i32,
    pub points_for_correct_stderr: i32,
    pub deduction_for_wrong_return_code: i32,
    pub deduction_for_wrong_stdout: i32,
    pub deduction_for_wrong_stderr: i32,
}

/// One instructor-defined test command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Shell command line, run as `bash -c <cmd>`
    pub cmd: String,

    #[serde(default)]
    pub stdin_source: StdinSource,
    #[serde(default)]
    pub stdin_text: String,
    #[serde(default)]
    pub stdin_instructor_file: Option<FileRef>,

    #[serde(default)]
    pub expected_return_code: ExpectedReturnCode,
    #[serde(default)]
    pub expected_stdout: ExpectedOutput,
    #[serde(default)]
    pub expected_stderr: ExpectedOutput,
    #[serde(default)]
    pub compare: CompareOptions,

    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub points: PointValues,
    #[serde(default)]
    pub feedback: FeedbackConfigs,
}

impl CommandSpec {
    pub fn new(id: i64, cmd: impl Into<String>) -> Self {
        Self {
            schema_version: COMMAND_SCHEMA_VERSION,
            id,
            name: String::new(),
            cmd: cmd.into(),
            stdin_source: StdinSource::None,
            stdin_text: String::new(),
            stdin_instructor_file: None,
            expected_return_code: ExpectedReturnCode::None,
            expected_stdout: ExpectedOutput::default(),
            expected_stderr: ExpectedOutput::default(),
            compare: CompareOptions::default(),
            limits: ResourceLimits::default(),
            points: PointValues::default(),
            feedback: FeedbackConfigs::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin_source = StdinSource::Text;
        self.stdin_text = text.into();
        self
    }

    pub fn with_stdin_file(mut self, file: FileRef) -> Self {
        self.stdin_source = StdinSource::InstructorFile;
        self.stdin_instructor_file = Some(file);
        self
    }

    pub fn with_stdin_source(mut self, source: StdinSource) -> Self {
        self.stdin_source = source;
        self
    }

    pub fn with_expected_return_code(mut self, expected: ExpectedReturnCode) -> Self {
        self.expected_return_code = expected;
        self
    }

    pub fn with_expected_stdout(mut self, expected: ExpectedOutput) -> Self {
        self.expected_stdout = expected;
        self
    }

    pub fn with_expected_stderr(mut self, expected: ExpectedOutput) -> Self {
        self.expected_stderr = expected;
        self
    }

    pub fn with_compare(mut self, compare: CompareOptions) -> Self {
        self.compare = compare;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_points(mut self, points: PointValues) -> Self {
        self.points = points;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfigs) -> Self {
        self.feedback = feedback;
        self
    }

    /// Files this command needs from storage, in a stable order
    pub fn instructor_files(&self) -> Vec<&FileRef> {
        let mut files = Vec::new();
        if self.stdin_source == StdinSource::InstructorFile {
            files.extend(self.stdin_instructor_file.as_ref());
        }
        for expected in [&self.expected_stdout, &self.expected_stderr] {
            if expected.source == ExpectedOutputSource::InstructorFile {
                files.extend(expected.instructor_file.as_ref());
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::level::FeedbackLevel;

    #[test]
    fn test_minimal_document_gets_defaults() {
        let spec: CommandSpec = serde_json::from_str(r#"{"id": 7, "cmd": "./run"}"#).unwrap();

        assert_eq!(spec.schema_version, COMMAND_SCHEMA_VERSION);
        assert_eq!(spec.stdin_source, StdinSource::None);
        assert_eq!(spec.expected_return_code, ExpectedReturnCode::None);
        assert!(!spec.expected_stdout.is_checked());
        assert_eq!(spec.limits.time_limit, DEFAULT_TIME_LIMIT_SECS);
        assert_eq!(spec.limits.virtual_memory_bytes(), None);
        assert!(spec.feedback.normal.visible);
        assert_eq!(spec.feedback.staff_viewer.stdout_fdbk_level, FeedbackLevel::MAX);
    }

    #[test]
    fn test_expected_return_code_wire_format() {
        let exact: ExpectedReturnCode = serde_json::from_str(r#"{"exact": 3}"#).unwrap();
        assert_eq!(exact, ExpectedReturnCode::Exact(3));
        let nonzero: ExpectedReturnCode = serde_json::from_str(r#""nonzero""#).unwrap();
        assert_eq!(nonzero, ExpectedReturnCode::Nonzero);
        assert!(!ExpectedReturnCode::None.is_checked());
        assert!(ExpectedReturnCode::Zero.is_checked());
    }

    #[test]
    fn test_virtual_memory_limit_only_when_enabled() {
        let limits = ResourceLimits {
            use_virtual_memory_limit: true,
            virtual_memory_limit: 1 << 20,
            ..ResourceLimits::default()
        };
        assert_eq!(limits.virtual_memory_bytes(), Some(1 << 20));
    }

    #[test]
    fn test_instructor_files_follow_sources() {
        let input = FileRef::new(1, "in.txt");
        let expected = FileRef::new(1, "out.txt");
        let mut spec = CommandSpec::new(1, "cat")
            .with_stdin_file(input.clone())
            .with_expected_stdout(ExpectedOutput::file(expected.clone()));
        assert_eq!(spec.instructor_files(), vec![&input, &expected]);

        // a dangling file reference is ignored once the source changes
        spec.stdin_source = StdinSource::Text;
        assert_eq!(spec.instructor_files(), vec![&expected]);
    }
}
