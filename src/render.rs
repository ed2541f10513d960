//! Result rendering
//!
//! Turns a fully graded command into what a particular viewer may see.
//! Every field of the view is optional and omitted from JSON when withheld.
//!
//! Disclosure rules per output aspect:
//! - correctness needs at least `correct_or_incorrect`
//! - the expected value, the actual value, its truncation flag and the diff
//!   need `expected_and_actual` and the matching `show_actual_*` flag
//!
//! Points and the timed-out flag each have their own switch. An invisible
//! command renders to nothing and contributes nothing to visible totals.

use serde::{Deserialize, Serialize};

use crate::checker::{diff_lines, CompareOptions};
use crate::core::command::ExpectedReturnCode;
use crate::core::feedback::{FeedbackCategory, FeedbackConfig, ViewContext};
use crate::core::level::FeedbackLevel;
use crate::error::GradeError;
use crate::grader::{GradedCase, GradedCommand, GradedSuite};
use crate::scoring::AspectOutcome;

/// What a viewer sees of one command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResultView {
    pub command_id: i64,
    pub command_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return_code: Option<ExpectedReturnCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_diff: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_diff: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_possible: Option<i32>,
}

/// What a viewer sees of one test case
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResultView {
    pub case_id: i64,
    pub case_name: String,
    pub commands: Vec<CommandResultView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points_possible: Option<i32>,
}

/// What a viewer sees of one suite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteResultView {
    pub suite_id: i64,
    pub suite_name: String,
    pub cases: Vec<CaseResultView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_points_possible: Option<i32>,
}

struct OutputView {
    correct: Option<bool>,
    expected: Option<String>,
    actual: Option<String>,
    truncated: Option<bool>,
    diff: Option<Vec<String>>,
}

fn render_output(
    level: FeedbackLevel,
    show_actual: bool,
    outcome: &AspectOutcome,
    expected: Option<&str>,
    actual: &str,
    truncated: bool,
    compare: &CompareOptions,
) -> OutputView {
    let show_values = level.allows(FeedbackLevel::ExpectedAndActual) && show_actual;

    OutputView {
        correct: outcome
            .correct
            .filter(|_| level.allows(FeedbackLevel::CorrectOrIncorrect)),
        expected: expected.filter(|_| show_values).map(str::to_string),
        actual: show_values.then(|| actual.to_string()),
        truncated: show_values.then_some(truncated),
        diff: match expected {
            Some(expected) if show_values => Some(diff_lines(expected, actual, compare)),
            _ => None,
        },
    }
}

/// Render one command under `config`. `None` when the command is invisible.
pub fn render_command(command: &GradedCommand, config: &FeedbackConfig) -> Option<CommandResultView> {
    if !config.visible {
        return None;
    }

    let obs = &command.observation;
    let outcome = &command.outcome;

    let rc_level = config.return_code_fdbk_level;
    let rc_values =
        rc_level.allows(FeedbackLevel::ExpectedAndActual) && config.show_actual_return_code;

    let stdout = render_output(
        config.stdout_fdbk_level,
        config.show_actual_stdout,
        &outcome.stdout,
        command.expected.stdout.as_deref(),
        &obs.stdout,
        obs.stdout_truncated,
        &command.compare,
    );
    let stderr = render_output(
        config.stderr_fdbk_level,
        config.show_actual_stderr,
        &outcome.stderr,
        command.expected.stderr.as_deref(),
        &obs.stderr,
        obs.stderr_truncated,
        &command.compare,
    );

    Some(CommandResultView {
        command_id: command.command_id,
        command_name: command.name.clone(),

        return_code_correct: outcome
            .return_code
            .correct
            .filter(|_| rc_level.allows(FeedbackLevel::CorrectOrIncorrect)),
        expected_return_code: Some(command.expected_return_code)
            .filter(|expected| rc_values && expected.is_checked()),
        actual_return_code: obs.return_code.filter(|_| rc_values),
        timed_out: config.show_whether_timed_out.then_some(obs.timed_out),

        stdout_correct: stdout.correct,
        expected_stdout: stdout.expected,
        actual_stdout: stdout.actual,
        stdout_truncated: stdout.truncated,
        stdout_diff: stdout.diff,

        stderr_correct: stderr.correct,
        expected_stderr: stderr.expected,
        actual_stderr: stderr.actual,
        stderr_truncated: stderr.truncated,
        stderr_diff: stderr.diff,

        points: config.show_points.then(|| outcome.total_points()),
        points_possible: config.show_points.then(|| outcome.total_points_possible()),
    })
}

/// Render one command under a named tier.
pub fn render_for_category(
    command: &GradedCommand,
    category: FeedbackCategory,
) -> Result<Option<CommandResultView>, GradeError> {
    let config = command.feedback.config_for(category)?;
    Ok(render_command(command, &config))
}

/// Points of a command the viewer is allowed to see; zero otherwise.
pub fn visible_points(command: &GradedCommand, config: &FeedbackConfig) -> i32 {
    if config.visible && config.show_points {
        command.outcome.total_points()
    } else {
        0
    }
}

/// Render a case for a viewing. The first-failed flag of `ctx` is derived
/// from the case, not taken from the caller.
///
/// `None` when no command of the case is visible.
pub fn render_case(
    case: &GradedCase,
    ctx: &ViewContext,
    first_failed_case: Option<i64>,
) -> Option<CaseResultView> {
    let ctx = ctx.with_first_failed(first_failed_case == Some(case.case_id));

    let mut commands = Vec::new();
    let mut raw_points = 0;
    let mut points_possible = 0;
    let mut any_points_shown = false;

    for command in &case.commands {
        let (_, config) = command.feedback.select(&ctx);
        let Some(view) = render_command(command, &config) else {
            continue;
        };
        raw_points += visible_points(command, &config);
        if let Some(possible) = view.points_possible {
            points_possible += possible;
            any_points_shown = true;
        }
        commands.push(view);
    }

    if commands.is_empty() {
        return None;
    }

    Some(CaseResultView {
        case_id: case.case_id,
        case_name: case.name.clone(),
        commands,
        total_points: any_points_shown.then_some(raw_points.max(0)),
        total_points_possible: any_points_shown.then_some(points_possible),
    })
}

/// Render a suite for a viewing.
pub fn render_suite(suite: &GradedSuite, ctx: &ViewContext) -> SuiteResultView {
    let cases: Vec<CaseResultView> = suite
        .cases
        .iter()
        .filter_map(|case| render_case(case, ctx, suite.first_failed_case))
        .collect();

    let shown: Vec<&CaseResultView> = cases
        .iter()
        .filter(|case| case.total_points.is_some())
        .collect();
    let any_shown = !shown.is_empty();

    SuiteResultView {
        suite_id: suite.suite_id,
        suite_name: suite.name.clone(),
        total_points: any_shown.then(|| shown.iter().filter_map(|c| c.total_points).sum()),
        total_points_possible: any_shown
            .then(|| shown.iter().filter_map(|c| c.total_points_possible).sum()),
        cases,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{CommandSpec, ExpectedOutput, PointValues};
    use crate::core::feedback::FeedbackConfigs;
    use crate::runner::ExecutionObservation;
    use crate::scoring::{grade_command, ResolvedExpectations};

    fn graded(spec: CommandSpec, expected_stdout: Option<&str>, obs: ExecutionObservation) -> GradedCommand {
        let expected = ResolvedExpectations {
            stdout: expected_stdout.map(str::to_string),
            stderr: None,
        };
        let outcome = grade_command(&spec, &expected, &obs);
        GradedCommand::new(&spec, expected, obs, outcome)
    }

    fn wrong_answer() -> GradedCommand {
        let spec = CommandSpec::new(5, "./prog")
            .with_name("run")
            .with_expected_return_code(ExpectedReturnCode::Zero)
            .with_expected_stdout(ExpectedOutput::text("42\n"))
            .with_points(PointValues {
                points_for_correct_return_code: 1,
                points_for_correct_stdout: 4,
                deduction_for_wrong_stdout: -2,
                ..PointValues::default()
            });
        graded(spec, Some("42\n"), ExecutionObservation::exited(0, "41\n", ""))
    }

    fn config(level: FeedbackLevel, show_actual: bool) -> FeedbackConfig {
        FeedbackConfig {
            return_code_fdbk_level: level,
            stdout_fdbk_level: level,
            stderr_fdbk_level: level,
            show_actual_return_code: show_actual,
            show_actual_stdout: show_actual,
            show_actual_stderr: show_actual,
            ..FeedbackConfig::default()
        }
    }

    #[test]
    fn test_no_feedback_discloses_nothing() {
        let view = render_command(&wrong_answer(), &config(FeedbackLevel::NoFeedback, true)).unwrap();
        assert_eq!(view.command_id, 5);
        assert_eq!(view.stdout_correct, None);
        assert_eq!(view.return_code_correct, None);
        assert_eq!(view.actual_stdout, None);
        assert_eq!(view.points, None);
        assert_eq!(view.timed_out, None);
    }

    #[test]
    fn test_correct_or_incorrect_never_shows_text() {
        let view =
            render_command(&wrong_answer(), &config(FeedbackLevel::CorrectOrIncorrect, true)).unwrap();
        assert_eq!(view.stdout_correct, Some(false));
        assert_eq!(view.return_code_correct, Some(true));
        assert_eq!(view.actual_stdout, None);
        assert_eq!(view.expected_stdout, None);
        assert_eq!(view.stdout_diff, None);
        assert_eq!(view.actual_return_code, None);
    }

    #[test]
    fn test_expected_and_actual_requires_show_flag_for_values() {
        let cmd = wrong_answer();

        let view = render_command(&cmd, &config(FeedbackLevel::ExpectedAndActual, false)).unwrap();
        assert_eq!(view.stdout_correct, Some(false));
        assert_eq!(view.expected_stdout, None);
        assert_eq!(view.expected_return_code, None);
        assert_eq!(view.actual_stdout, None);
        assert_eq!(view.stdout_truncated, None);
        assert_eq!(view.stdout_diff, None);
        assert_eq!(view.actual_return_code, None);

        let view = render_command(&cmd, &config(FeedbackLevel::ExpectedAndActual, true)).unwrap();
        assert_eq!(view.expected_stdout.as_deref(), Some("42\n"));
        assert_eq!(view.expected_return_code, Some(ExpectedReturnCode::Zero));
        assert_eq!(view.actual_stdout.as_deref(), Some("41\n"));
        assert_eq!(view.stdout_truncated, Some(false));
        assert_eq!(view.actual_return_code, Some(0));
        assert_eq!(
            view.stdout_diff,
            Some(vec!["- 42".to_string(), "+ 41".to_string(), "  ".to_string()])
        );
    }

    /// Names of every field the view discloses
    fn disclosed(view: &CommandResultView) -> Vec<&'static str> {
        [
            ("return_code_correct", view.return_code_correct.is_some()),
            ("expected_return_code", view.expected_return_code.is_some()),
            ("actual_return_code", view.actual_return_code.is_some()),
            ("timed_out", view.timed_out.is_some()),
            ("stdout_correct", view.stdout_correct.is_some()),
            ("expected_stdout", view.expected_stdout.is_some()),
            ("actual_stdout", view.actual_stdout.is_some()),
            ("stdout_truncated", view.stdout_truncated.is_some()),
            ("stdout_diff", view.stdout_diff.is_some()),
            ("stderr_correct", view.stderr_correct.is_some()),
            ("expected_stderr", view.expected_stderr.is_some()),
            ("actual_stderr", view.actual_stderr.is_some()),
            ("stderr_truncated", view.stderr_truncated.is_some()),
            ("stderr_diff", view.stderr_diff.is_some()),
            ("points", view.points.is_some()),
            ("points_possible", view.points_possible.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, shown)| shown.then_some(name))
        .collect()
    }

    #[test]
    fn test_higher_levels_never_disclose_less() {
        let cmd = wrong_answer();
        for show_actual in [false, true] {
            for show_points in [false, true] {
                let mut previous: Vec<&'static str> = Vec::new();
                for level in FeedbackLevel::ALL {
                    let cfg = FeedbackConfig {
                        show_points,
                        show_whether_timed_out: show_points,
                        ..config(level, show_actual)
                    };
                    let shown = disclosed(&render_command(&cmd, &cfg).unwrap());
                    for field in &previous {
                        assert!(
                            shown.contains(field),
                            "{} withheld at {:?} (show_actual={}, show_points={})",
                            field,
                            level,
                            show_actual,
                            show_points
                        );
                    }
                    previous = shown;
                }
            }
        }
    }

    #[test]
    fn test_unchecked_stream_has_no_correctness_or_expected_value() {
        let view = render_command(&wrong_answer(), &FeedbackConfig::max()).unwrap();
        assert_eq!(view.stderr_correct, None);
        assert_eq!(view.expected_stderr, None);
        assert_eq!(view.stderr_diff, None);
        // actual output is still disclosed under full feedback
        assert_eq!(view.actual_stderr.as_deref(), Some(""));
    }

    #[test]
    fn test_points_and_timeout_flags_are_independent() {
        let cmd = wrong_answer();
        let mut cfg = FeedbackConfig::default();
        cfg.show_points = true;
        let view = render_command(&cmd, &cfg).unwrap();
        assert_eq!(view.points, Some(-1));
        assert_eq!(view.points_possible, Some(5));
        assert_eq!(view.timed_out, None);

        cfg.show_points = false;
        cfg.show_whether_timed_out = true;
        let view = render_command(&cmd, &cfg).unwrap();
        assert_eq!(view.points, None);
        assert_eq!(view.timed_out, Some(false));
    }

    #[test]
    fn test_invisible_command_renders_nothing() {
        let cmd = wrong_answer();
        assert!(render_command(&cmd, &FeedbackConfig::hidden()).is_none());
        let hidden_with_points = FeedbackConfig {
            show_points: true,
            ..FeedbackConfig::hidden()
        };
        assert_eq!(visible_points(&cmd, &hidden_with_points), 0);
    }

    #[test]
    fn test_timed_out_command_view() {
        let spec = CommandSpec::new(9, "sleep 100")
            .with_expected_return_code(ExpectedReturnCode::Zero)
            .with_points(PointValues {
                points_for_correct_return_code: 3,
                ..PointValues::default()
            });
        let cmd = graded(spec, None, ExecutionObservation::timed_out("", ""));

        let view = render_command(&cmd, &FeedbackConfig::max()).unwrap();
        assert_eq!(view.timed_out, Some(true));
        assert_eq!(view.actual_return_code, None);
        assert_eq!(view.return_code_correct, Some(false));
        assert_eq!(view.points, Some(0));
    }

    #[test]
    fn test_omitted_fields_are_not_serialized() {
        let view = render_command(&wrong_answer(), &FeedbackConfig::default()).unwrap();
        let json = serde_json::to_value(&view).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("command_id"));
        assert!(!obj.contains_key("stdout_correct"));
        assert!(!obj.contains_key("points"));
    }

    #[test]
    fn test_render_for_missing_category_is_error() {
        let cmd = wrong_answer();
        assert!(matches!(
            render_for_category(&cmd, FeedbackCategory::FirstFailedTest),
            Err(GradeError::MissingFeedbackConfig(_))
        ));
        assert!(render_for_category(&cmd, FeedbackCategory::Normal).unwrap().is_some());
    }

    fn case_with(commands: Vec<GradedCommand>) -> GradedCase {
        GradedCase::new(1, "case", commands)
    }

    fn with_feedback(mut cmd: GradedCommand, normal: FeedbackConfig) -> GradedCommand {
        cmd.feedback = FeedbackConfigs {
            normal,
            ..FeedbackConfigs::default()
        };
        cmd
    }

    #[test]
    fn test_case_total_is_floored_over_visible_commands() {
        let shown = FeedbackConfig {
            show_points: true,
            ..FeedbackConfig::default()
        };
        // -1 visible
        let a = with_feedback(wrong_answer(), shown);
        // -1 hidden entirely
        let b = with_feedback(wrong_answer(), FeedbackConfig::hidden());

        let view = render_case(&case_with(vec![a, b]), &ViewContext::student(), None).unwrap();
        assert_eq!(view.commands.len(), 1);
        assert_eq!(view.total_points, Some(0));
        assert_eq!(view.total_points_possible, Some(5));
    }

    #[test]
    fn test_case_with_no_visible_commands_is_hidden() {
        let a = with_feedback(wrong_answer(), FeedbackConfig::hidden());
        assert!(render_case(&case_with(vec![a]), &ViewContext::student(), None).is_none());
    }

    #[test]
    fn test_first_failed_case_uses_its_config() {
        let mut cmd = wrong_answer();
        cmd.feedback.first_failed_test = Some(FeedbackConfig::max());
        let case = case_with(vec![cmd]);

        let view = render_case(&case, &ViewContext::student(), Some(1)).unwrap();
        assert_eq!(view.commands[0].actual_stdout.as_deref(), Some("41\n"));

        let view = render_case(&case, &ViewContext::student(), Some(2)).unwrap();
        assert_eq!(view.commands[0].actual_stdout, None);
    }
}
