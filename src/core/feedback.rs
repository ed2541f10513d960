//! Feedback configuration and tier selection
//!
//! Every command carries one `FeedbackConfig` per tier. Which tier applies
//! depends on who is looking and at which submission; `FeedbackConfigs::select`
//! encodes that precedence.
//!
//! This module does NOT:
//! - Apply a config to results (see `render`)
//! - Decide whether a submission is past its daily limit or is the ultimate
//!   submission; callers pass those facts in a `ViewContext`

use serde::{Deserialize, Serialize};
use std::fmt;

use super::level::FeedbackLevel;
use crate::error::GradeError;

/// Disclosure settings for one command under one tier.
///
/// Levels gate correctness. Expected and actual values additionally need the
/// matching `show_actual_*` flag; both must allow a value before it is
/// disclosed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub visible: bool,
    pub return_code_fdbk_level: FeedbackLevel,
    pub stdout_fdbk_level: FeedbackLevel,
    pub stderr_fdbk_level: FeedbackLevel,
    pub show_points: bool,
    pub show_actual_return_code: bool,
    pub show_actual_stdout: bool,
    pub show_actual_stderr: bool,
    pub show_whether_timed_out: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            visible: true,
            return_code_fdbk_level: FeedbackLevel::MIN,
            stdout_fdbk_level: FeedbackLevel::MIN,
            stderr_fdbk_level: FeedbackLevel::MIN,
            show_points: false,
            show_actual_return_code: false,
            show_actual_stdout: false,
            show_actual_stderr: false,
            show_whether_timed_out: false,
        }
    }
}

impl FeedbackConfig {
    /// Everything visible at the highest level.
    pub fn max() -> Self {
        Self {
            visible: true,
            return_code_fdbk_level: FeedbackLevel::MAX,
            stdout_fdbk_level: FeedbackLevel::MAX,
            stderr_fdbk_level: FeedbackLevel::MAX,
            show_points: true,
            show_actual_return_code: true,
            show_actual_stdout: true,
            show_actual_stderr: true,
            show_whether_timed_out: true,
        }
    }

    /// Default for a student's final graded submission.
    pub fn ultimate_submission_default() -> Self {
        Self {
            visible: true,
            return_code_fdbk_level: FeedbackLevel::CorrectOrIncorrect,
            stdout_fdbk_level: FeedbackLevel::CorrectOrIncorrect,
            stderr_fdbk_level: FeedbackLevel::CorrectOrIncorrect,
            show_points: true,
            show_actual_return_code: true,
            show_actual_stdout: false,
            show_actual_stderr: false,
            show_whether_timed_out: true,
        }
    }

    pub fn hidden() -> Self {
        Self {
            visible: false,
            ..Self::default()
        }
    }
}

/// The feedback tiers a result can be viewed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Normal,
    FirstFailedTest,
    UltimateSubmission,
    PastLimitSubmission,
    StaffViewer,
    /// Full disclosure, used for true totals
    Max,
}

impl fmt::Display for FeedbackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedbackCategory::Normal => "normal",
            FeedbackCategory::FirstFailedTest => "first_failed_test",
            FeedbackCategory::UltimateSubmission => "ultimate_submission",
            FeedbackCategory::PastLimitSubmission => "past_limit_submission",
            FeedbackCategory::StaffViewer => "staff_viewer",
            FeedbackCategory::Max => "max",
        };
        write!(f, "{}", s)
    }
}

/// The five canonical configs of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfigs {
    pub normal: FeedbackConfig,
    /// Only applies when configured
    pub first_failed_test: Option<FeedbackConfig>,
    pub ultimate_submission: FeedbackConfig,
    pub past_limit_submission: FeedbackConfig,
    pub staff_viewer: FeedbackConfig,
}

impl Default for FeedbackConfigs {
    fn default() -> Self {
        Self {
            normal: FeedbackConfig::default(),
            first_failed_test: None,
            ultimate_submission: FeedbackConfig::ultimate_submission_default(),
            past_limit_submission: FeedbackConfig::default(),
            staff_viewer: FeedbackConfig::max(),
        }
    }
}

/// Facts about a viewing that decide the tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub viewer_is_staff: bool,
    pub viewer_owns_submission: bool,
    pub is_ultimate_submission: bool,
    pub past_daily_limit: bool,
    /// The command belongs to the submission's first failed test case
    pub in_first_failed_test: bool,
}

impl ViewContext {
    pub fn student() -> Self {
        Self {
            viewer_owns_submission: true,
            ..Self::default()
        }
    }

    pub fn staff_viewing_other() -> Self {
        Self {
            viewer_is_staff: true,
            ..Self::default()
        }
    }

    pub fn with_ultimate(mut self, value: bool) -> Self {
        self.is_ultimate_submission = value;
        self
    }

    pub fn with_past_limit(mut self, value: bool) -> Self {
        self.past_daily_limit = value;
        self
    }

    pub fn with_first_failed(mut self, value: bool) -> Self {
        self.in_first_failed_test = value;
        self
    }
}

impl FeedbackConfigs {
    /// Pick the tier and its config for a viewing.
    ///
    /// Precedence: staff viewing someone else's submission, then past the
    /// daily limit, then first failed test (when configured), then ultimate
    /// submission, then normal.
    pub fn select(&self, ctx: &ViewContext) -> (FeedbackCategory, FeedbackConfig) {
        if ctx.viewer_is_staff && !ctx.viewer_owns_submission {
            return (FeedbackCategory::StaffViewer, self.staff_viewer);
        }
        if ctx.past_daily_limit {
            return (FeedbackCategory::PastLimitSubmission, self.past_limit_submission);
        }
        if ctx.in_first_failed_test {
            if let Some(config) = self.first_failed_test {
                return (FeedbackCategory::FirstFailedTest, config);
            }
        }
        if ctx.is_ultimate_submission {
            return (FeedbackCategory::UltimateSubmission, self.ultimate_submission);
        }
        (FeedbackCategory::Normal, self.normal)
    }

    /// The config stored for `category`, if there is one.
    pub fn get(&self, category: FeedbackCategory) -> Option<FeedbackConfig> {
        match category {
            FeedbackCategory::Normal => Some(self.normal),
            FeedbackCategory::FirstFailedTest => self.first_failed_test,
            FeedbackCategory::UltimateSubmission => Some(self.ultimate_submission),
            FeedbackCategory::PastLimitSubmission => Some(self.past_limit_submission),
            FeedbackCategory::StaffViewer => Some(self.staff_viewer),
            FeedbackCategory::Max => Some(FeedbackConfig::max()),
        }
    }

    /// Like `get`, but a missing config is an error.
    pub fn config_for(&self, category: FeedbackCategory) -> Result<FeedbackConfig, GradeError> {
        self.get(category)
            .ok_or(GradeError::MissingFeedbackConfig(category))
    }
}
