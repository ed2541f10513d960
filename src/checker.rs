//! Output checking
//!
//! Compares a program's output with the instructor's expected output after
//! applying the command's normalization toggles, checks exit codes, and
//! builds line diffs for full-disclosure feedback.
//!
//! Normalization is applied to both sides in a fixed order:
//! 1. lowercase (`ignore_case`)
//! 2. drop lines that are blank after trimming (`ignore_blank_lines`)
//! 3. collapse whitespace runs to one space and trim line edges
//!    (`ignore_whitespace_changes`)
//! 4. remove whitespace inside lines (`ignore_whitespace`)
//!
//! Lines are split on `\n` only. Line breaks are never removed by steps 3-4.
//!
//! This module does NOT:
//! - Run programs or read files
//! - Assign points (see `scoring`)

use serde::{Deserialize, Serialize};

use crate::core::command::ExpectedReturnCode;

/// Normalization toggles for output comparison
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareOptions {
    pub ignore_case: bool,
    pub ignore_whitespace: bool,
    pub ignore_whitespace_changes: bool,
    pub ignore_blank_lines: bool,
}

impl CompareOptions {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn with_ignore_case(mut self, value: bool) -> Self {
        self.ignore_case = value;
        self
    }

    pub fn with_ignore_whitespace(mut self, value: bool) -> Self {
        self.ignore_whitespace = value;
        self
    }

    pub fn with_ignore_whitespace_changes(mut self, value: bool) -> Self {
        self.ignore_whitespace_changes = value;
        self
    }

    pub fn with_ignore_blank_lines(mut self, value: bool) -> Self {
        self.ignore_blank_lines = value;
        self
    }
}

/// Above this many table cells the diff skips the LCS and reports the
/// differing middle wholesale.
const MAX_DIFF_CELLS: usize = 4_000_000;

/// Normalize one line. `None` means the line is dropped.
fn normalize_line(line: &str, opts: &CompareOptions) -> Option<String> {
    let mut line = if opts.ignore_case {
        line.to_lowercase()
    } else {
        line.to_string()
    };

    if opts.ignore_blank_lines && line.trim().is_empty() {
        return None;
    }

    if opts.ignore_whitespace_changes {
        line = line.split_whitespace().collect::<Vec<_>>().join(" ");
    }

    if opts.ignore_whitespace {
        line.retain(|c| !c.is_whitespace());
    }

    Some(line)
}

/// Normalized lines paired with the raw line they came from
fn normalized_lines<'a>(text: &'a str, opts: &CompareOptions) -> Vec<(String, &'a str)> {
    text.split('\n')
        .filter_map(|raw| normalize_line(raw, opts).map(|n| (n, raw)))
        .collect()
}

/// Apply the normalization pipeline to `text`.
pub fn normalize(text: &str, opts: &CompareOptions) -> String {
    normalized_lines(text, opts)
        .into_iter()
        .map(|(line, _)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether `actual` matches `expected` under `opts`.
pub fn outputs_match(expected: &str, actual: &str, opts: &CompareOptions) -> bool {
    normalize(expected, opts) == normalize(actual, opts)
}

/// Check an exit status against the expectation.
///
/// Returns `None` when the return code isn't checked. A missing return code
/// (the program timed out) never matches.
pub fn check_return_code(expected: ExpectedReturnCode, actual: Option<i32>) -> Option<bool> {
    let correct = match (expected, actual) {
        (ExpectedReturnCode::None, _) => return None,
        (_, None) => false,
        (ExpectedReturnCode::Zero, Some(code)) => code == 0,
        (ExpectedReturnCode::Nonzero, Some(code)) => code != 0,
        (ExpectedReturnCode::Exact(want), Some(code)) => code == want,
    };
    Some(correct)
}

/// Line diff of `expected` against `actual` under `opts`.
///
/// Each entry is a raw line prefixed with `"  "` (in both), `"- "` (expected
/// only) or `"+ "` (actual only). Lines dropped by normalization are omitted.
pub fn diff_lines(expected: &str, actual: &str, opts: &CompareOptions) -> Vec<String> {
    let a = normalized_lines(expected, opts);
    let b = normalized_lines(actual, opts);

    let prefix = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x.0 == y.0)
        .count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x.0 == y.0)
        .count();

    let mut out = Vec::with_capacity(a.len().max(b.len()));
    out.extend(a[..prefix].iter().map(|(_, raw)| format!("  {}", raw)));

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];
    diff_middle(mid_a, mid_b, &mut out);

    out.extend(
        a[a.len() - suffix..]
            .iter()
            .map(|(_, raw)| format!("  {}", raw)),
    );
    out
}

fn diff_middle(a: &[(String, &str)], b: &[(String, &str)], out: &mut Vec<String>) {
    let (n, m) = (a.len(), b.len());
    if n.saturating_mul(m) > MAX_DIFF_CELLS {
        out.extend(a.iter().map(|(_, raw)| format!("- {}", raw)));
        out.extend(b.iter().map(|(_, raw)| format!("+ {}", raw)));
        return;
    }

    // lcs[i * (m + 1) + j] = LCS length of a[i..] and b[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if a[i].0 == b[j].0 {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i].0 == b[j].0 {
            out.push(format!("  {}", a[i].1));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            out.push(format!("- {}", a[i].1));
            i += 1;
        } else {
            out.push(format!("+ {}", b[j].1));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|(_, raw)| format!("- {}", raw)));
    out.extend(b[j..].iter().map(|(_, raw)| format!("+ {}", raw)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_required_by_default() {
        let opts = CompareOptions::exact();
        assert!(outputs_match("4\n", "4\n", &opts));
        assert!(!outputs_match("4\n", "4 \n", &opts));
        assert!(!outputs_match("4\n", "4", &opts));
    }

    #[test]
    fn test_whitespace_changes_ignores_trailing_space() {
        let opts = CompareOptions::exact().with_ignore_whitespace_changes(true);
        assert!(outputs_match("4\n", "4 \n", &opts));
        assert!(outputs_match("a  b\tc\n", " a b c\n", &opts));
        assert!(!outputs_match("ab\n", "a b\n", &opts));
    }

    #[test]
    fn test_ignore_whitespace_removes_inline_whitespace() {
        let opts = CompareOptions::exact().with_ignore_whitespace(true);
        assert!(outputs_match("ab\n", "a b\n", &opts));
        assert!(outputs_match("1 2 3\r\n", "123\n", &opts));
        // line structure is preserved
        assert!(!outputs_match("a\nb\n", "ab\n", &opts));
    }

    #[test]
    fn test_ignore_case() {
        let opts = CompareOptions::exact().with_ignore_case(true);
        assert!(outputs_match("Hello World\n", "hello world\n", &opts));
        assert!(!outputs_match("Hello World\n", "hello  world\n", &opts));
    }

    #[test]
    fn test_ignore_blank_lines() {
        let opts = CompareOptions::exact().with_ignore_blank_lines(true);
        assert!(outputs_match("a\n\nb\n", "a\nb", &opts));
        assert!(outputs_match("a\n   \nb\n", "a\nb\n", &opts));
        assert!(!outputs_match("a\nb\n", "b\na\n", &opts));
    }

    #[test]
    fn test_blank_lines_dropped_before_whitespace_removal() {
        let opts = CompareOptions::exact().with_ignore_whitespace(true);
        // without ignore_blank_lines the whitespace-only line still counts
        assert!(!outputs_match("a\n  \nb", "a\nb", &opts));
        let opts = opts.with_ignore_blank_lines(true);
        assert!(outputs_match("a\n  \nb", "a\nb", &opts));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = ["  Hello\t World \n\n\r\nX  y\n", "", "\n\n", "ABC def"];
        for ignore_case in [false, true] {
            for ignore_whitespace in [false, true] {
                for ignore_changes in [false, true] {
                    for ignore_blank in [false, true] {
                        let opts = CompareOptions {
                            ignore_case,
                            ignore_whitespace,
                            ignore_whitespace_changes: ignore_changes,
                            ignore_blank_lines: ignore_blank,
                        };
                        for sample in samples {
                            let once = normalize(sample, &opts);
                            assert_eq!(normalize(&once, &opts), once, "{:?}", opts);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_check_return_code() {
        assert_eq!(check_return_code(ExpectedReturnCode::None, Some(3)), None);
        assert_eq!(check_return_code(ExpectedReturnCode::None, None), None);
        assert_eq!(check_return_code(ExpectedReturnCode::Zero, Some(0)), Some(true));
        assert_eq!(check_return_code(ExpectedReturnCode::Zero, Some(1)), Some(false));
        assert_eq!(check_return_code(ExpectedReturnCode::Nonzero, Some(-9)), Some(true));
        assert_eq!(check_return_code(ExpectedReturnCode::Exact(3), Some(3)), Some(true));
        assert_eq!(check_return_code(ExpectedReturnCode::Exact(3), Some(0)), Some(false));
    }

    #[test]
    fn test_missing_return_code_never_matches() {
        assert_eq!(check_return_code(ExpectedReturnCode::Zero, None), Some(false));
        assert_eq!(check_return_code(ExpectedReturnCode::Nonzero, None), Some(false));
    }

    #[test]
    fn test_diff_marks_changed_lines() {
        let diff = diff_lines("a\nb\nc\n", "a\nx\nc\n", &CompareOptions::exact());
        assert_eq!(diff, vec!["  a", "- b", "+ x", "  c", "  "]);
    }

    #[test]
    fn test_diff_insertions_and_deletions() {
        let diff = diff_lines("one\ntwo", "zero\none\ntwo\nthree", &CompareOptions::exact());
        assert_eq!(diff, vec!["+ zero", "  one", "  two", "+ three"]);

        let diff = diff_lines("one\ntwo\nthree", "one\nthree", &CompareOptions::exact());
        assert_eq!(diff, vec!["  one", "- two", "  three"]);
    }

    #[test]
    fn test_diff_respects_normalization() {
        let opts = CompareOptions::exact().with_ignore_case(true);
        let diff = diff_lines("Hello\n", "HELLO\n", &opts);
        assert!(diff.iter().all(|line| line.starts_with("  ")));
    }

    #[test]
    fn test_diff_of_equal_texts_has_no_changes() {
        let text = "x\ny\nz";
        let diff = diff_lines(text, text, &CompareOptions::exact());
        assert_eq!(diff, vec!["  x", "  y", "  z"]);
    }
}
