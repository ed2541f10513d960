//! Sandbox module - Low-level isolate wrapper
//!
//! This module provides a minimal abstraction over the isolate sandbox.
//! It handles:
//! - Isolate box initialization and cleanup
//! - Cgroup detection
//! - Building the isolate command line
//! - Parsing isolate's meta file
//!
//! The sandbox module does NOT:
//! - Decide what a timeout or crash means for grading
//! - Resolve stdin or expected outputs
//! - Compare outputs

pub mod isolate_box;
pub mod meta;

// Re-exports for convenience
pub use isolate_box::{is_cgroups_available, IoSpec, IsolateBox, Limits, SandboxOutcome};
pub use meta::{parse_meta, IsolateMeta, IsolateStatus};
