//! Autograder engine
//!
//! Runs instructor-defined test commands against a submission in a sandbox,
//! checks their outputs, scores them, and renders results at the feedback
//! level a viewer is entitled to. Normal-tier results are kept in a
//! denormalized per-submission cache.

pub mod cache;
pub mod checker;
pub mod config;
pub mod core;
pub mod error;
pub mod grader;
pub mod jobs;
pub mod redis_manager;
pub mod render;
pub mod runner;
pub mod sandbox;
pub mod scoring;
pub mod storage;

pub use crate::error::{ConfigurationError, GradeError, SandboxError};
pub use crate::grader::{Grader, GradedCase, GradedCommand, GradedSuite};
pub use crate::jobs::WorkerJob;
