//! Canopy – a resumable workflow execution core
//!
//! This crate walks a tree of activities, executes them cooperatively and
//! can suspend mid-execution to wait for external input:
//! - An arena-backed activity instance tree with a strict state machine
//! - Bookmarks for suspension and resumption, surviving process restarts
//! - Execution properties and handles scoped to subtrees
//! - Reference-counted no-persist regions and ambient runtime transactions
//! - Parallel-branch tagging
//! - A host that persists, unloads and reloads instances with identity checks

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{RuntimeConfig, WorkflowHost};

/// Current version of the Canopy runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
