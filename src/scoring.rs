//! Score calculation
//!
//! A command's outcome is three independent aspects (return code, stdout,
//! stderr). Each checked aspect either earns its points or applies its
//! deduction, so a command's delta can be negative. The floor at zero is
//! applied once, when a test case's command deltas are summed.

use serde::{Deserialize, Serialize};

use crate::checker::{check_return_code, outputs_match};
use crate::core::command::CommandSpec;
use crate::runner::ExecutionObservation;

/// Result of grading one aspect of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AspectOutcome {
    /// `None` when the aspect isn't checked
    pub correct: Option<bool>,
    /// Points earned or deducted
    pub points: i32,
    /// Points available for a correct result
    pub points_possible: i32,
}

impl AspectOutcome {
    pub fn unchecked() -> Self {
        Self::default()
    }

    pub fn graded(correct: bool, points_for_correct: i32, deduction_for_wrong: i32) -> Self {
        Self {
            correct: Some(correct),
            points: if correct {
                points_for_correct
            } else {
                deduction_for_wrong
            },
            points_possible: points_for_correct,
        }
    }

    pub fn is_checked(&self) -> bool {
        self.correct.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.correct == Some(false)
    }
}

/// Graded aspects of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub return_code: AspectOutcome,
    pub stdout: AspectOutcome,
    pub stderr: AspectOutcome,
}

impl CommandOutcome {
    fn aspects(&self) -> [&AspectOutcome; 3] {
        [&self.return_code, &self.stdout, &self.stderr]
    }

    /// Net point delta. May be negative.
    pub fn total_points(&self) -> i32 {
        self.aspects().iter().map(|a| a.points).sum()
    }

    pub fn total_points_possible(&self) -> i32 {
        self.aspects().iter().map(|a| a.points_possible).sum()
    }

    /// Whether any checked aspect was wrong
    pub fn has_failure(&self) -> bool {
        self.aspects().iter().any(|a| a.is_failed())
    }
}

/// Expected outputs after resolving text or instructor files.
/// `None` means the stream isn't checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedExpectations {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Grade an observation against a command's expectations.
pub fn grade_command(
    spec: &CommandSpec,
    expected: &ResolvedExpectations,
    observation: &ExecutionObservation,
) -> CommandOutcome {
    let points = &spec.points;

    let return_code = match check_return_code(spec.expected_return_code, observation.return_code)
    {
        Some(correct) => AspectOutcome::graded(
            correct,
            points.points_for_correct_return_code,
            points.deduction_for_wrong_return_code,
        ),
        None => AspectOutcome::unchecked(),
    };

    let stdout = match &expected.stdout {
        Some(text) => AspectOutcome::graded(
            outputs_match(text, &observation.stdout, &spec.compare),
            points.points_for_correct_stdout,
            points.deduction_for_wrong_stdout,
        ),
        None => AspectOutcome::unchecked(),
    };

    let stderr = match &expected.stderr {
        Some(text) => AspectOutcome::graded(
            outputs_match(text, &observation.stderr, &spec.compare),
            points.points_for_correct_stderr,
            points.deduction_for_wrong_stderr,
        ),
        None => AspectOutcome::unchecked(),
    };

    CommandOutcome {
        return_code,
        stdout,
        stderr,
    }
}

/// Points for one test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaseScore {
    /// Sum of command deltas before the floor
    pub raw_points: i32,
    /// `max(raw_points, 0)`
    pub points: i32,
    pub points_possible: i32,
}

/// Sum command outcomes into a case score, flooring at zero.
pub fn score_case<'a, I>(outcomes: I) -> CaseScore
where
    I: IntoIterator<Item = &'a CommandOutcome>,
{
    let (raw_points, points_possible) = outcomes
        .into_iter()
        .fold((0, 0), |(raw, possible), outcome| {
            (
                raw + outcome.total_points(),
                possible + outcome.total_points_possible(),
            )
        });

    CaseScore {
        raw_points,
        points: raw_points.max(0),
        points_possible,
    }
}

/// Suite total: floored case scores summed, with no further floor.
pub fn score_suite<'a, I>(cases: I) -> CaseScore
where
    I: IntoIterator<Item = &'a CaseScore>,
{
    cases
        .into_iter()
        .fold(CaseScore::default(), |acc, case| CaseScore {
            raw_points: acc.raw_points + case.points,
            points: acc.points + case.points,
            points_possible: acc.points_possible + case.points_possible,
        })
}
