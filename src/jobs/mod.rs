//! Jobs consumed by the worker and the status it reports back
//!
//! Each job kind has a `process_*` function that does the work against the
//! stores it is handed. The worker binary owns the queue and status
//! publishing; these functions never touch Redis directly.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cache::{
    normal_results_prefix, refresh_normal_results, CommandPath, RenderCache, ResultPath,
    ResultStore, SubmissionKey,
};
use crate::grader::{Grader, SuiteSpec};
use crate::runner::AbortSignal;

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Grade a submission against its project's suites
    #[serde(rename = "grade")]
    Grade(GradeJob),
    /// Drop a deleted suite, case or command from every cached submission
    #[serde(rename = "prune_results")]
    PruneResults(PruneJob),
    /// A command or its feedback configs were edited; its cached views are
    /// stale in every submission until regraded
    #[serde(rename = "command_updated")]
    CommandUpdated(CommandUpdatedJob),
    /// Drop every cached render of a project
    #[serde(rename = "invalidate_results_cache")]
    InvalidateResultsCache(InvalidateJob),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeJob {
    pub submission_id: i64,
    pub project_id: i64,
    pub suites: Vec<SuiteSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneJob {
    pub project_id: i64,
    pub path: ResultPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandUpdatedJob {
    pub project_id: i64,
    pub suite_id: i64,
    pub case_id: i64,
    pub command_id: i64,
}

impl CommandUpdatedJob {
    pub fn path(&self) -> CommandPath {
        CommandPath::new(self.suite_id, self.case_id, self.command_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateJob {
    pub project_id: i64,
}

/// Grading state of a submission as published to pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingState {
    Grading,
    Finished,
    /// Grading could not complete; nothing was scored
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingStatus {
    pub submission_id: i64,
    pub project_id: i64,
    pub status: GradingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_points: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_points_possible: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl GradingStatus {
    pub fn grading(job: &GradeJob) -> Self {
        Self {
            submission_id: job.submission_id,
            project_id: job.project_id,
            status: GradingState::Grading,
            total_points: None,
            total_points_possible: None,
            error_message: None,
        }
    }

    pub fn finished(job: &GradeJob, total_points: i32, total_points_possible: i32) -> Self {
        Self {
            status: GradingState::Finished,
            total_points: Some(total_points),
            total_points_possible: Some(total_points_possible),
            ..Self::grading(job)
        }
    }

    pub fn error(job: &GradeJob, message: impl Into<String>) -> Self {
        Self {
            status: GradingState::Error,
            error_message: Some(message.into()),
            ..Self::grading(job)
        }
    }
}

/// Grade a submission and report how it ended.
///
/// Completed suites are merged into `store` as they finish. Any failure,
/// including an infrastructure failure, yields an `error` status; results of
/// the suite in flight are never cached.
pub async fn process_grade_job(
    grader: &Grader,
    job: &GradeJob,
    store: &dyn ResultStore,
    renders: &dyn RenderCache,
    abort: &AbortSignal,
) -> GradingStatus {
    let submission = SubmissionKey::new(job.project_id, job.submission_id);

    let status = match grader
        .grade_submission(submission, &job.suites, store, abort)
        .await
    {
        Ok(suites) => {
            let (points, possible) = suites.iter().fold((0, 0), |(points, possible), suite| {
                let score = suite.score();
                (points + score.points, possible + score.points_possible)
            });
            GradingStatus::finished(job, points, possible)
        }
        Err(e) => {
            error!("Failed to grade submission {}: {}", job.submission_id, e);
            GradingStatus::error(job, e.to_string())
        }
    };

    // Suites merged before a failure are still valid
    if let Err(e) = refresh_normal_results(store, renders, submission).await {
        error!(
            "Failed to refresh cached results of submission {}: {:#}",
            job.submission_id, e
        );
    }

    status
}

/// Prune a deleted node from every submission of the project. Cached renders
/// of the project are dropped as they may embed the pruned node.
pub async fn process_prune_job(
    job: &PruneJob,
    store: &dyn ResultStore,
    renders: &dyn RenderCache,
) -> Result<usize> {
    let touched = store.prune(job.project_id, &job.path).await?;
    let dropped = renders
        .invalidate_prefix(&normal_results_prefix(job.project_id))
        .await?;
    info!(
        "Pruned {:?} from {} submissions of project {} ({} cached renders dropped)",
        job.path, touched, job.project_id, dropped
    );
    Ok(touched)
}

/// Drop an edited command's cached views from every submission of the
/// project, the same way a deletion does.
pub async fn process_command_updated_job(
    job: &CommandUpdatedJob,
    store: &dyn ResultStore,
    renders: &dyn RenderCache,
) -> Result<usize> {
    let prune = PruneJob {
        project_id: job.project_id,
        path: ResultPath::command(job.path()),
    };
    process_prune_job(&prune, store, renders).await
}

pub async fn process_invalidate_job(job: &InvalidateJob, renders: &dyn RenderCache) -> Result<usize> {
    let dropped = renders
        .invalidate_prefix(&normal_results_prefix(job.project_id))
        .await?;
    info!(
        "Invalidated {} cached renders of project {}",
        dropped, job.project_id
    );
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::cache::{normal_results_key, MemoryRenderCache, MemoryResultStore};
    use crate::config::GraderConfig;
    use crate::core::command::{CommandSpec, ExpectedReturnCode, PointValues};
    use crate::error::SandboxError;
    use crate::grader::CaseSpec;
    use crate::runner::{ExecutionObservation, RunLimits, Runner};
    use crate::storage::MemoryFileProvider;

    /// Exits 0 with no output, except `down` which can't get a sandbox
    struct FixedRunner;

    #[async_trait]
    impl Runner for FixedRunner {
        async fn run(
            &self,
            cmd: &str,
            _limits: &RunLimits,
            _stdin: Option<&[u8]>,
            _abort: &AbortSignal,
        ) -> Result<ExecutionObservation, SandboxError> {
            if cmd == "down" {
                return Err(SandboxError::Provisioning("isolate missing".into()));
            }
            Ok(ExecutionObservation::exited(0, "", ""))
        }
    }

    fn grader() -> Grader {
        Grader::new(Arc::new(FixedRunner), Arc::new(MemoryFileProvider::new()))
            .with_config(GraderConfig::default())
    }

    fn grade_job(suites: Vec<SuiteSpec>) -> GradeJob {
        GradeJob {
            submission_id: 10,
            project_id: 1,
            suites,
        }
    }

    fn single_suite(suite_id: i64, cmd: &str) -> SuiteSpec {
        let mut command = CommandSpec::new(suite_id * 10, cmd)
            .with_expected_return_code(ExpectedReturnCode::Zero)
            .with_points(PointValues {
                points_for_correct_return_code: 3,
                ..PointValues::default()
            });
        command.feedback.normal.show_points = true;
        SuiteSpec {
            suite_id,
            name: String::new(),
            setup_cmd: None,
            cases: vec![CaseSpec {
                case_id: suite_id,
                name: String::new(),
                commands: vec![command],
            }],
        }
    }

    #[test]
    fn test_parse_grade_job() {
        let json = r#"{
            "job_type": "grade",
            "submission_id": 7,
            "project_id": 2,
            "suites": [{
                "suite_id": 1,
                "cases": [{
                    "case_id": 3,
                    "commands": [{
                        "id": 4,
                        "cmd": "python3 main.py",
                        "stdin_source": "text",
                        "stdin_text": "1 2\n",
                        "expected_return_code": "zero",
                        "expected_stdout": {"source": "text", "text": "3\n"},
                        "points": {"points_for_correct_stdout": 2}
                    }]
                }]
            }]
        }"#;

        let WorkerJob::Grade(job) = serde_json::from_str::<WorkerJob>(json).unwrap() else {
            panic!("expected a grade job");
        };
        assert_eq!(job.submission_id, 7);
        let command = &job.suites[0].cases[0].commands[0];
        assert_eq!(command.cmd, "python3 main.py");
        assert_eq!(command.points.points_for_correct_stdout, 2);
        assert_eq!(command.limits.time_limit, 10);
        assert!(job.suites[0].setup_cmd.is_none());
    }

    #[test]
    fn test_parse_prune_and_invalidate_jobs() {
        let prune: WorkerJob = serde_json::from_str(
            r#"{"job_type": "prune_results", "project_id": 1,
                "path": {"level": "case", "suite_id": 2, "case_id": 3}}"#,
        )
        .unwrap();
        assert!(matches!(
            prune,
            WorkerJob::PruneResults(PruneJob {
                project_id: 1,
                path: ResultPath::Case {
                    suite_id: 2,
                    case_id: 3
                }
            })
        ));

        let invalidate: WorkerJob =
            serde_json::from_str(r#"{"job_type": "invalidate_results_cache", "project_id": 9}"#)
                .unwrap();
        assert!(matches!(
            invalidate,
            WorkerJob::InvalidateResultsCache(InvalidateJob { project_id: 9 })
        ));
    }

    #[test]
    fn test_status_serialization() {
        let job = GradeJob {
            submission_id: 1,
            project_id: 2,
            suites: vec![],
        };
        let json = serde_json::to_value(GradingStatus::finished(&job, 3, 5)).unwrap();
        assert_eq!(json["status"], "finished");
        assert_eq!(json["total_points"], 3);
        assert!(json.get("error_message").is_none());

        let json = serde_json::to_value(GradingStatus::error(&job, "sandbox down")).unwrap();
        assert_eq!(json["status"], "error");
        assert!(json.get("total_points").is_none());
    }

    #[tokio::test]
    async fn test_grade_job_finishes_and_refreshes_render() {
        let store = MemoryResultStore::new();
        let renders = MemoryRenderCache::new();
        let job = grade_job(vec![single_suite(1, "ok"), single_suite(2, "ok")]);

        let status =
            process_grade_job(&grader(), &job, &store, &renders, &AbortSignal::never()).await;
        assert_eq!(status.status, GradingState::Finished);
        assert_eq!(status.total_points, Some(6));
        assert_eq!(status.total_points_possible, Some(6));

        let cached = renders.get(&normal_results_key(1, 10)).await.unwrap().unwrap();
        assert!(cached.contains("\"points\":3"));
    }

    #[tokio::test]
    async fn test_infra_failure_reports_error_and_caches_nothing_from_failed_suite() {
        let store = MemoryResultStore::new();
        let renders = MemoryRenderCache::new();
        let job = grade_job(vec![single_suite(1, "ok"), single_suite(2, "down")]);

        let status =
            process_grade_job(&grader(), &job, &store, &renders, &AbortSignal::never()).await;
        assert_eq!(status.status, GradingState::Error);
        assert!(status.total_points.is_none());
        assert!(status.error_message.unwrap().contains("command 20"));

        let results = store.load(SubmissionKey::new(1, 10)).await.unwrap();
        assert!(results.get(&CommandPath::new(1, 1, 10)).is_some());
        assert!(results.get(&CommandPath::new(2, 2, 20)).is_none());
    }

    #[tokio::test]
    async fn test_prune_job_drops_project_renders() {
        let store = MemoryResultStore::new();
        let renders = MemoryRenderCache::new();
        let job = grade_job(vec![single_suite(1, "ok")]);
        process_grade_job(&grader(), &job, &store, &renders, &AbortSignal::never()).await;
        renders.set(&normal_results_key(2, 10), "other").await.unwrap();

        let prune = PruneJob {
            project_id: 1,
            path: ResultPath::Suite { suite_id: 1 },
        };
        assert_eq!(process_prune_job(&prune, &store, &renders).await.unwrap(), 1);
        assert_eq!(renders.get(&normal_results_key(1, 10)).await.unwrap(), None);
        assert!(renders.get(&normal_results_key(2, 10)).await.unwrap().is_some());
        assert_eq!(
            store.load(SubmissionKey::new(1, 10)).await.unwrap().command_count(),
            0
        );
    }

    #[tokio::test]
    async fn test_command_updated_job_drops_stale_views() {
        let store = MemoryResultStore::new();
        let renders = MemoryRenderCache::new();
        let job = grade_job(vec![single_suite(1, "ok"), single_suite(2, "ok")]);
        process_grade_job(&grader(), &job, &store, &renders, &AbortSignal::never()).await;

        let updated: WorkerJob = serde_json::from_str(
            r#"{"job_type": "command_updated", "project_id": 1,
                "suite_id": 1, "case_id": 1, "command_id": 10}"#,
        )
        .unwrap();
        let WorkerJob::CommandUpdated(updated) = updated else {
            panic!("expected a command update");
        };

        assert_eq!(
            process_command_updated_job(&updated, &store, &renders).await.unwrap(),
            1
        );
        let results = store.load(SubmissionKey::new(1, 10)).await.unwrap();
        assert!(results.get(&CommandPath::new(1, 1, 10)).is_none());
        assert!(results.get(&CommandPath::new(2, 2, 20)).is_some());
        assert_eq!(renders.get(&normal_results_key(1, 10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_job() {
        let renders = MemoryRenderCache::new();
        renders.set(&normal_results_key(4, 1), "a").await.unwrap();
        renders.set(&normal_results_key(4, 2), "b").await.unwrap();

        let dropped = process_invalidate_job(&InvalidateJob { project_id: 4 }, &renders)
            .await
            .unwrap();
        assert_eq!(dropped, 2);
    }
}
