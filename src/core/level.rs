use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// How much of a graded aspect a viewer may see.
///
/// Ordered from least to most disclosure. The order comes from an explicit
/// rank table, not from declaration order, so reordering variants can't
/// silently change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    #[default]
    NoFeedback,
    CorrectOrIncorrect,
    ExpectedAndActual,
}

impl FeedbackLevel {
    /// Every level, least disclosing first
    pub const ALL: [FeedbackLevel; 3] = [
        FeedbackLevel::NoFeedback,
        FeedbackLevel::CorrectOrIncorrect,
        FeedbackLevel::ExpectedAndActual,
    ];

    pub const MIN: FeedbackLevel = FeedbackLevel::NoFeedback;
    pub const MAX: FeedbackLevel = FeedbackLevel::ExpectedAndActual;

    pub const fn rank(self) -> u8 {
        match self {
            FeedbackLevel::NoFeedback => 0,
            FeedbackLevel::CorrectOrIncorrect => 1,
            FeedbackLevel::ExpectedAndActual => 2,
        }
    }

    /// Whether this level discloses at least as much as `other`.
    pub fn allows(self, other: FeedbackLevel) -> bool {
        self >= other
    }
}

impl Ord for FeedbackLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for FeedbackLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FeedbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedbackLevel::NoFeedback => "no_feedback",
            FeedbackLevel::CorrectOrIncorrect => "correct_or_incorrect",
            FeedbackLevel::ExpectedAndActual => "expected_and_actual",
        };
        write!(f, "{}", s)
    }
}
