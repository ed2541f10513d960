//! Result caches
//!
//! Two caches sit in front of result views:
//! - `ResultStore`: one denormalized aggregate per submission holding the
//!   normal-tier view of every graded command, keyed by suite, case and
//!   command. Each graded suite replaces its subtree wholesale; deleting or
//!   editing a suite, case or command prunes the matching subtree from every
//!   submission of the project.
//! - `RenderCache`: opaque rendered documents keyed by string, invalidated by
//!   key prefix.
//!
//! This module does NOT:
//! - Render or grade anything
//! - Decide when to invalidate (the worker does)

pub mod memory;
pub mod redis_store;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::render::CommandResultView;

pub use self::memory::{MemoryRenderCache, MemoryResultStore};
pub use self::redis_store::{RedisRenderCache, RedisResultStore};

/// Identifies a submission within its project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionKey {
    pub project_id: i64,
    pub submission_id: i64,
}

impl SubmissionKey {
    pub fn new(project_id: i64, submission_id: i64) -> Self {
        Self {
            project_id,
            submission_id,
        }
    }
}

/// Location of one command result inside an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandPath {
    pub suite_id: i64,
    pub case_id: i64,
    pub command_id: i64,
}

impl CommandPath {
    pub fn new(suite_id: i64, case_id: i64, command_id: i64) -> Self {
        Self {
            suite_id,
            case_id,
            command_id,
        }
    }

    /// Flat field name, `suite/case/command`
    pub fn field(&self) -> String {
        format!("{}/{}/{}", self.suite_id, self.case_id, self.command_id)
    }

    pub fn parse_field(field: &str) -> Option<Self> {
        let mut parts = field.split('/');
        let path = Self {
            suite_id: parts.next()?.parse().ok()?,
            case_id: parts.next()?.parse().ok()?,
            command_id: parts.next()?.parse().ok()?,
        };
        parts.next().is_none().then_some(path)
    }
}

/// A subtree to prune
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum ResultPath {
    Suite { suite_id: i64 },
    Case { suite_id: i64, case_id: i64 },
    Command { suite_id: i64, case_id: i64, command_id: i64 },
}

impl ResultPath {
    pub fn command(path: CommandPath) -> Self {
        ResultPath::Command {
            suite_id: path.suite_id,
            case_id: path.case_id,
            command_id: path.command_id,
        }
    }

    /// Field prefix matched by this path. Command paths match exactly.
    pub fn field_pattern(&self) -> (String, bool) {
        match *self {
            ResultPath::Suite { suite_id } => (format!("{}/", suite_id), true),
            ResultPath::Case { suite_id, case_id } => (format!("{}/{}/", suite_id, case_id), true),
            ResultPath::Command {
                suite_id,
                case_id,
                command_id,
            } => (CommandPath::new(suite_id, case_id, command_id).field(), false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenormalizedCase {
    pub commands: BTreeMap<i64, CommandResultView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenormalizedSuite {
    pub cases: BTreeMap<i64, DenormalizedCase>,
}

/// Normal-tier results of one submission, nested suite -> case -> command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenormalizedResults {
    pub suites: BTreeMap<i64, DenormalizedSuite>,
}

impl DenormalizedResults {
    /// Insert or replace the result at `path`. Siblings are untouched.
    pub fn merge(&mut self, path: CommandPath, result: CommandResultView) {
        self.suites
            .entry(path.suite_id)
            .or_default()
            .cases
            .entry(path.case_id)
            .or_default()
            .commands
            .insert(path.command_id, result);
    }

    /// Replace everything under `suite_id` with `results`. Entries outside the
    /// suite are ignored.
    pub fn replace_suite(
        &mut self,
        suite_id: i64,
        results: impl IntoIterator<Item = (CommandPath, CommandResultView)>,
    ) {
        self.suites.remove(&suite_id);
        for (path, view) in results {
            if path.suite_id == suite_id {
                self.merge(path, view);
            }
        }
    }

    /// Remove the subtree at `path`. Returns whether anything was removed.
    ///
    /// Only the named node is removed; an emptied parent stays.
    pub fn prune(&mut self, path: &ResultPath) -> bool {
        match *path {
            ResultPath::Suite { suite_id } => self.suites.remove(&suite_id).is_some(),
            ResultPath::Case { suite_id, case_id } => self
                .suites
                .get_mut(&suite_id)
                .is_some_and(|suite| suite.cases.remove(&case_id).is_some()),
            ResultPath::Command {
                suite_id,
                case_id,
                command_id,
            } => self
                .suites
                .get_mut(&suite_id)
                .and_then(|suite| suite.cases.get_mut(&case_id))
                .is_some_and(|case| case.commands.remove(&command_id).is_some()),
        }
    }

    pub fn get(&self, path: &CommandPath) -> Option<&CommandResultView> {
        self.suites
            .get(&path.suite_id)?
            .cases
            .get(&path.case_id)?
            .commands
            .get(&path.command_id)
    }

    pub fn command_count(&self) -> usize {
        self.suites
            .values()
            .flat_map(|suite| suite.cases.values())
            .map(|case| case.commands.len())
            .sum()
    }

    /// Visible total: per-case sums floored at zero, then summed.
    pub fn total_points(&self) -> i32 {
        self.suites
            .values()
            .flat_map(|suite| suite.cases.values())
            .map(|case| {
                case.commands
                    .values()
                    .filter_map(|view| view.points)
                    .sum::<i32>()
                    .max(0)
            })
            .sum()
    }

    /// Flatten into `(path, view)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (CommandPath, &CommandResultView)> {
        self.suites.iter().flat_map(|(suite_id, suite)| {
            suite.cases.iter().flat_map(move |(case_id, case)| {
                case.commands.iter().map(move |(command_id, view)| {
                    (CommandPath::new(*suite_id, *case_id, *command_id), view)
                })
            })
        })
    }
}

/// Store of denormalized per-submission results.
///
/// Merges into one submission are atomic with respect to each other; merges
/// into different submissions don't interact.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn merge(
        &self,
        submission: SubmissionKey,
        path: CommandPath,
        result: CommandResultView,
    ) -> Result<()>;

    /// Atomically replace a suite's subtree. Readers see either the old
    /// subtree or the new one; a failed call leaves the old one in place.
    async fn replace_suite(
        &self,
        submission: SubmissionKey,
        suite_id: i64,
        results: Vec<(CommandPath, CommandResultView)>,
    ) -> Result<()>;

    async fn load(&self, submission: SubmissionKey) -> Result<DenormalizedResults>;

    /// Remove `path` from every submission of `project_id`. Returns the number
    /// of submissions that changed.
    async fn prune(&self, project_id: i64, path: &ResultPath) -> Result<usize>;
}

/// Key/value cache of rendered documents
#[async_trait]
pub trait RenderCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Drop every entry whose key starts with `prefix`. Returns how many.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Render-cache key for a submission's normal-tier results
pub fn normal_results_key(project_id: i64, submission_id: i64) -> String {
    format!("{}{}", normal_results_prefix(project_id), submission_id)
}

/// Prefix covering every submission's normal-tier results in a project
pub fn normal_results_prefix(project_id: i64) -> String {
    format!("project_{}_submission_normal_results_", project_id)
}

/// Rebuild a submission's normal-tier document from the store and cache it.
pub async fn refresh_normal_results(
    store: &dyn ResultStore,
    renders: &dyn RenderCache,
    submission: SubmissionKey,
) -> Result<String> {
    let results = store.load(submission).await?;
    let document = serde_json::to_string(&results)?;
    renders
        .set(
            &normal_results_key(submission.project_id, submission.submission_id),
            &document,
        )
        .await?;
    Ok(document)
}

/// A submission's normal-tier document, from the render cache when present.
pub async fn normal_results_document(
    store: &dyn ResultStore,
    renders: &dyn RenderCache,
    submission: SubmissionKey,
) -> Result<String> {
    let key = normal_results_key(submission.project_id, submission.submission_id);
    if let Some(document) = renders.get(&key).await? {
        return Ok(document);
    }
    refresh_normal_results(store, renders, submission).await
}
