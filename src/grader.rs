//! Grader module for running a submission's test suites
//!
//! Drives the runner over suites, cases and commands, resolves stdin and
//! expected outputs, and scores every command. Commands within a case run in
//! order because a command may read its predecessor's output. Completed
//! suites are published to the result store as normal-tier views.
//!
//! This module does NOT:
//! - Spawn or sandbox processes (see `runner`)
//! - Decide what a viewer may see (see `render`)
//! - Talk to Redis directly (see `cache` and `redis_manager`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CommandPath, ResultStore, SubmissionKey};
use crate::checker::CompareOptions;
use crate::config::{get_config, GraderConfig};
use crate::core::command::{
    CommandSpec, ExpectedOutput, ExpectedOutputSource, ExpectedReturnCode, StdinSource,
};
use crate::core::feedback::{FeedbackCategory, FeedbackConfigs};
use crate::error::{GradeError, SandboxError};
use crate::render::{render_for_category, CommandResultView};
use crate::runner::{AbortSignal, ExecutionObservation, RunLimits, Runner};
use crate::scoring::{
    grade_command, score_case, score_suite, CaseScore, CommandOutcome, ResolvedExpectations,
};
use crate::storage::FileProvider;

/// One test case: commands run in order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSpec {
    pub case_id: i64,
    #[serde(default)]
    pub name: String,
    pub commands: Vec<CommandSpec>,
}

/// One suite: an optional setup command, then cases in declared order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub suite_id: i64,
    #[serde(default)]
    pub name: String,
    /// Runs once before the cases. Its output feeds the first command of
    /// every case that reads upstream output.
    #[serde(default)]
    pub setup_cmd: Option<CommandSpec>,
    pub cases: Vec<CaseSpec>,
}

/// A command after execution and scoring, with everything rendering needs
#[derive(Debug, Clone, PartialEq)]
pub struct GradedCommand {
    pub command_id: i64,
    pub name: String,
    pub expected_return_code: ExpectedReturnCode,
    pub expected: ResolvedExpectations,
    pub compare: CompareOptions,
    pub observation: ExecutionObservation,
    pub outcome: CommandOutcome,
    pub feedback: FeedbackConfigs,
}

impl GradedCommand {
    pub fn new(
        spec: &CommandSpec,
        expected: ResolvedExpectations,
        observation: ExecutionObservation,
        outcome: CommandOutcome,
    ) -> Self {
        Self {
            command_id: spec.id,
            name: spec.name.clone(),
            expected_return_code: spec.expected_return_code,
            expected,
            compare: spec.compare,
            observation,
            outcome,
            feedback: spec.feedback,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradedCase {
    pub case_id: i64,
    pub name: String,
    pub commands: Vec<GradedCommand>,
    /// True score, floored; independent of any viewer
    pub score: CaseScore,
}

impl GradedCase {
    pub fn new(case_id: i64, name: impl Into<String>, commands: Vec<GradedCommand>) -> Self {
        let score = score_case(commands.iter().map(|c| &c.outcome));
        Self {
            case_id,
            name: name.into(),
            commands,
            score,
        }
    }

    pub fn has_failure(&self) -> bool {
        self.commands.iter().any(|c| c.outcome.has_failure())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradedSuite {
    pub suite_id: i64,
    pub name: String,
    pub setup: Option<ExecutionObservation>,
    pub cases: Vec<GradedCase>,
    /// First case, in declared order, with a failed checked aspect
    pub first_failed_case: Option<i64>,
}

impl GradedSuite {
    pub fn new(
        suite_id: i64,
        name: impl Into<String>,
        setup: Option<ExecutionObservation>,
        cases: Vec<GradedCase>,
    ) -> Self {
        let first_failed_case = cases.iter().find(|c| c.has_failure()).map(|c| c.case_id);
        Self {
            suite_id,
            name: name.into(),
            setup,
            cases,
            first_failed_case,
        }
    }

    /// Sum of floored case scores
    pub fn score(&self) -> CaseScore {
        score_suite(self.cases.iter().map(|c| &c.score))
    }

    /// Normal-tier views of every visible command, keyed for the result store
    pub fn normal_results(&self) -> Result<Vec<(CommandPath, CommandResultView)>, GradeError> {
        let mut results = Vec::new();
        for case in &self.cases {
            for command in &case.commands {
                if let Some(view) = render_for_category(command, FeedbackCategory::Normal)? {
                    let path = CommandPath::new(self.suite_id, case.case_id, command.command_id);
                    results.push((path, view));
                }
            }
        }
        Ok(results)
    }
}

/// Replace a suite's cached results with its normal-tier views in one store
/// call. Commands no longer visible under the normal tier drop out.
/// Returns the number of entries written.
pub async fn publish_suite(
    store: &dyn ResultStore,
    submission: SubmissionKey,
    suite: &GradedSuite,
) -> Result<usize, GradeError> {
    let results = suite.normal_results()?;
    let count = results.len();
    store
        .replace_suite(submission, suite.suite_id, results)
        .await
        .map_err(GradeError::Cache)?;
    debug!(
        "Published {} results of suite {} to submission {}",
        count, suite.suite_id, submission.submission_id
    );
    Ok(count)
}

/// Runs and scores commands
#[derive(Clone)]
pub struct Grader {
    runner: Arc<dyn Runner>,
    files: Arc<dyn FileProvider>,
    config: GraderConfig,
}

impl Grader {
    pub fn new(runner: Arc<dyn Runner>, files: Arc<dyn FileProvider>) -> Self {
        Self {
            runner,
            files,
            config: get_config().clone(),
        }
    }

    pub fn with_config(mut self, config: GraderConfig) -> Self {
        self.config = config;
        self
    }

    /// Limits for one run. Unset limits fall back to the engine defaults and
    /// the time limit never exceeds the engine ceiling.
    pub fn run_limits(&self, spec: &CommandSpec) -> RunLimits {
        let mut limits = spec.limits;
        if limits.time_limit == 0 {
            limits.time_limit = self.config.default_time_limit_secs;
        }
        if limits.use_virtual_memory_limit && limits.virtual_memory_limit == 0 {
            limits.virtual_memory_limit = self.config.default_virtual_memory_limit;
        }
        let time_limit = limits.time_limit.min(self.config.max_time_limit_secs);

        RunLimits::for_command(&limits, &self.config)
            .with_time_limit(Duration::from_secs(u64::from(time_limit)))
    }

    async fn resolve_stdin(
        &self,
        spec: &CommandSpec,
        upstream: Option<&ExecutionObservation>,
    ) -> Result<Option<Vec<u8>>, GradeError> {
        let stdin = match spec.stdin_source {
            StdinSource::None => None,
            StdinSource::Text => Some(spec.stdin_text.as_bytes().to_vec()),
            StdinSource::InstructorFile => {
                let file = spec.stdin_instructor_file.as_ref().ok_or_else(|| {
                    GradeError::FileUnavailable(anyhow!("command {} has no stdin file", spec.id))
                })?;
                Some(self.files.read(file).await.map_err(GradeError::FileUnavailable)?)
            }
            StdinSource::UpstreamStdout => upstream.map(|o| o.stdout.as_bytes().to_vec()),
            StdinSource::UpstreamStderr => upstream.map(|o| o.stderr.as_bytes().to_vec()),
        };
        Ok(stdin)
    }

    async fn resolve_expected(
        &self,
        command_id: i64,
        expected: &ExpectedOutput,
    ) -> Result<Option<String>, GradeError> {
        match expected.source {
            ExpectedOutputSource::None => Ok(None),
            ExpectedOutputSource::Text => Ok(Some(expected.text.clone())),
            ExpectedOutputSource::InstructorFile => {
                let file = expected.instructor_file.as_ref().ok_or_else(|| {
                    GradeError::FileUnavailable(anyhow!(
                        "command {} has no expected output file",
                        command_id
                    ))
                })?;
                let text = self
                    .files
                    .read_string(file)
                    .await
                    .map_err(GradeError::FileUnavailable)?;
                Ok(Some(text))
            }
        }
    }

    /// Load the expected stdout and stderr of a command.
    pub async fn resolve_expectations(
        &self,
        spec: &CommandSpec,
    ) -> Result<ResolvedExpectations, GradeError> {
        Ok(ResolvedExpectations {
            stdout: self.resolve_expected(spec.id, &spec.expected_stdout).await?,
            stderr: self.resolve_expected(spec.id, &spec.expected_stderr).await?,
        })
    }

    /// Run a command once. Sandbox failures, including observations the
    /// sandbox can't vouch for, become `GradeError::InfraFailure`.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
        abort: &AbortSignal,
    ) -> Result<ExecutionObservation, GradeError> {
        if abort.is_aborted() {
            return Err(GradeError::Aborted);
        }

        let limits = self.run_limits(spec);
        let observation = self
            .runner
            .run(&spec.cmd, &limits, stdin, abort)
            .await
            .map_err(|e| GradeError::from_sandbox(spec.id, e))?;

        if let Some(message) = &observation.infra_failure {
            warn!("Command {} hit an infrastructure failure: {}", spec.id, message);
            return Err(GradeError::InfraFailure {
                command_id: spec.id,
                source: SandboxError::Infra(message.clone()),
            });
        }

        debug!(
            "Command {} finished: return_code={:?}, timed_out={}, truncated={}/{}",
            spec.id,
            observation.return_code,
            observation.timed_out,
            observation.stdout_truncated,
            observation.stderr_truncated
        );
        Ok(observation)
    }

    /// Resolve inputs, run, and score one command.
    pub async fn grade_command(
        &self,
        spec: &CommandSpec,
        upstream: Option<&ExecutionObservation>,
        abort: &AbortSignal,
    ) -> Result<GradedCommand, GradeError> {
        let stdin = self.resolve_stdin(spec, upstream).await?;
        let expected = self.resolve_expectations(spec).await?;
        let observation = self.execute(spec, stdin.as_deref(), abort).await?;
        let outcome = grade_command(spec, &expected, &observation);
        Ok(GradedCommand::new(spec, expected, observation, outcome))
    }

    /// Grade a case's commands in order. Each command's upstream is the
    /// previous command; the first one's is the suite setup output.
    pub async fn grade_case(
        &self,
        case: &CaseSpec,
        setup: Option<&ExecutionObservation>,
        abort: &AbortSignal,
    ) -> Result<GradedCase, GradeError> {
        let mut commands: Vec<GradedCommand> = Vec::with_capacity(case.commands.len());
        for spec in &case.commands {
            let upstream = commands.last().map(|c| &c.observation).or(setup);
            let graded = self.grade_command(spec, upstream, abort).await?;
            commands.push(graded);
        }

        let graded = GradedCase::new(case.case_id, case.name.clone(), commands);
        debug!(
            "Case {} scored {}/{} (raw {})",
            case.case_id, graded.score.points, graded.score.points_possible, graded.score.raw_points
        );
        Ok(graded)
    }

    pub async fn grade_suite(
        &self,
        suite: &SuiteSpec,
        abort: &AbortSignal,
    ) -> Result<GradedSuite, GradeError> {
        let setup = match &suite.setup_cmd {
            Some(spec) => {
                let stdin = self.resolve_stdin(spec, None).await?;
                Some(self.execute(spec, stdin.as_deref(), abort).await?)
            }
            None => None,
        };

        let mut cases = Vec::with_capacity(suite.cases.len());
        for case in &suite.cases {
            cases.push(self.grade_case(case, setup.as_ref(), abort).await?);
        }

        Ok(GradedSuite::new(suite.suite_id, suite.name.clone(), setup, cases))
    }

    /// Grade every suite and publish each one as soon as it completes.
    ///
    /// An error stops grading; the suite in flight is discarded, suites
    /// already published stay.
    pub async fn grade_submission(
        &self,
        submission: SubmissionKey,
        suites: &[SuiteSpec],
        store: &dyn ResultStore,
        abort: &AbortSignal,
    ) -> Result<Vec<GradedSuite>, GradeError> {
        let mut graded = Vec::with_capacity(suites.len());
        for suite in suites {
            let result = self.grade_suite(suite, abort).await?;
            if abort.is_aborted() {
                return Err(GradeError::Aborted);
            }
            publish_suite(store, submission, &result).await?;
            graded.push(result);
        }

        let total: i32 = graded.iter().map(|s| s.score().points).sum();
        let possible: i32 = graded.iter().map(|s| s.score().points_possible).sum();
        info!(
            "Submission {} graded: {}/{} across {} suites",
            submission.submission_id,
            total,
            possible,
            graded.len()
        );
        Ok(graded)
    }
}
