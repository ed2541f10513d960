//! Command validation
//!
//! Pure checks run when a command is saved. Every problem is reported against
//! the field that caused it so an editor can show them all at once.

use super::command::{
    CommandSpec, ExpectedOutput, ExpectedOutputSource, FileRef, StdinSource,
    MAX_EXPECTED_OUTPUT_TEXT_LENGTH,
};
use crate::error::ConfigurationError;

/// Validate `spec` as a command of `project_id`.
///
/// `max_time_limit_secs` is the engine-wide ceiling (see `GraderConfig`).
pub fn validate_command(
    spec: &CommandSpec,
    project_id: i64,
    max_time_limit_secs: u32,
) -> Result<(), ConfigurationError> {
    let mut errors = ConfigurationError::new();

    if spec.cmd.trim().is_empty() {
        errors.add("cmd", "Command must not be empty");
    }

    if spec.stdin_source == StdinSource::InstructorFile {
        check_file_ref(
            &mut errors,
            "stdin_instructor_file",
            spec.stdin_instructor_file.as_ref(),
            project_id,
        );
    }

    check_expected_output(&mut errors, "expected_stdout", &spec.expected_stdout, project_id);
    check_expected_output(&mut errors, "expected_stderr", &spec.expected_stderr, project_id);

    let limits = &spec.limits;
    if limits.time_limit < 1 || limits.time_limit > max_time_limit_secs {
        errors.add(
            "time_limit",
            format!("Time limit must be between 1 and {} seconds", max_time_limit_secs),
        );
    }
    if limits.use_virtual_memory_limit && limits.virtual_memory_limit == 0 {
        errors.add("virtual_memory_limit", "Virtual memory limit must be positive");
    }

    let points = &spec.points;
    for (field, value) in [
        ("points_for_correct_return_code", points.points_for_correct_return_code),
        ("points_for_correct_stdout", points.points_for_correct_stdout),
        ("points_for_correct_stderr", points.points_for_correct_stderr),
    ] {
        if value < 0 {
            errors.add(field, "Points must not be negative");
        }
    }
    for (field, value) in [
        ("deduction_for_wrong_return_code", points.deduction_for_wrong_return_code),
        ("deduction_for_wrong_stdout", points.deduction_for_wrong_stdout),
        ("deduction_for_wrong_stderr", points.deduction_for_wrong_stderr),
    ] {
        if value > 0 {
            errors.add(field, "Deductions must be zero or negative");
        }
    }

    errors.into_result()
}

fn check_expected_output(
    errors: &mut ConfigurationError,
    prefix: &str,
    expected: &ExpectedOutput,
    project_id: i64,
) {
    match expected.source {
        ExpectedOutputSource::None => {}
        ExpectedOutputSource::Text => {
            if expected.text.len() > MAX_EXPECTED_OUTPUT_TEXT_LENGTH {
                errors.add(
                    format!("{}_text", prefix),
                    format!(
                        "Expected output text may be at most {} bytes",
                        MAX_EXPECTED_OUTPUT_TEXT_LENGTH
                    ),
                );
            }
        }
        ExpectedOutputSource::InstructorFile => check_file_ref(
            errors,
            &format!("{}_instructor_file", prefix),
            expected.instructor_file.as_ref(),
            project_id,
        ),
    }
}

fn check_file_ref(
    errors: &mut ConfigurationError,
    field: &str,
    file: Option<&FileRef>,
    project_id: i64,
) {
    match file {
        None => errors.add(field, "This field cannot be empty when its source is a file"),
        Some(file) if file.project_id != project_id => errors.add(
            field,
            format!("File {} does not belong to this project", file.name),
        ),
        Some(_) => {}
    }
}
