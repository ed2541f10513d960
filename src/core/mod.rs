//! Core domain model
//!
//! Plain data types describing test commands and how much of their results a
//! viewer may see, plus pure validation. Nothing here performs I/O.

pub mod command;
pub mod feedback;
pub mod level;
pub mod validation;

pub use command::{
    CommandSpec, ExpectedOutput, ExpectedOutputSource, ExpectedReturnCode, FileRef, PointValues,
    ResourceLimits, StdinSource,
};
pub use feedback::{FeedbackCategory, FeedbackConfig, FeedbackConfigs, ViewContext};
pub use level::FeedbackLevel;
pub use validation::validate_command;
