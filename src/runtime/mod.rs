//! Workflow runtime core and public API
//!
//! This module wires the subsystems together: definitions and their
//! metadata cache, the instance tree, bookmarks, execution properties and
//! handles, the executor that drives them, and the host that persists and
//! resumes instances.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// Submodules
pub mod activity;
pub mod bookmark;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod flags;
pub mod handle;
pub mod host;
pub mod instance;
pub mod location;
pub mod no_persist;
pub mod parallel;
pub mod properties;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod tracking;
pub mod transaction;

/// Boundary timeouts enforced by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Loading and restoring an instance
    pub open: Duration,
    /// Unloading an instance
    pub close: Duration,
    /// Reading a snapshot from the store
    pub load: Duration,
    /// Writing a snapshot to the store
    pub save: Duration,
    /// Acquiring exclusive access to the executor
    pub acquire_lock: Duration,
    /// Async bookmark resumption
    pub resume_bookmark: Duration,
    /// Running until idle; unbounded when `None`
    pub invoke: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        let thirty = Duration::from_secs(30);
        Self {
            open: thirty,
            close: thirty,
            load: thirty,
            save: thirty,
            acquire_lock: thirty,
            resume_bookmark: thirty,
            invoke: None,
        }
    }
}

/// Dispatcher a host posts async work to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatcherMode {
    /// The process-wide serial queue
    #[default]
    Default,
    /// The calling thread
    Inline,
}

/// Configuration for the workflow runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (default: .canopy/)
    pub root: PathBuf,

    /// Boundary timeouts
    pub timeouts: Timeouts,

    /// Dispatcher used for async host operations
    pub dispatcher: DispatcherMode,

    /// Persist whenever an instance goes idle and persistence is allowed
    pub persist_on_idle: bool,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".canopy"),
            timeouts: Timeouts::default(),
            dispatcher: DispatcherMode::Default,
            persist_on_idle: true,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Initialize storage directories and write this configuration
    pub fn init(&self) -> error::StorageResult<()> {
        storage::init_storage(&self.root)?;
        storage::write_config(self)
    }

    /// Load the configuration stored under `root`
    pub fn load(root: &std::path::Path) -> error::StorageResult<Self> {
        storage::load_config(root)
    }
}

// Re-export commonly used types
pub use activity::{Activity, ActivityBehavior, ActivityResult, WorkflowDefinition, WorkflowIdentity};
pub use bookmark::{Bookmark, BookmarkResumptionResult};
pub use context::{CodeActivityContext, FaultContext, NativeActivityContext, ScheduleOptions, TransactionContext};
pub use error::{ContractError, Result, RuntimeError};
pub use executor::{Executor, WorkflowOutcome};
pub use flags::{BookmarkOptions, CacheState, VariableModifiers};
pub use host::{HostStatus, WorkflowHost, WorkflowInstanceId};
pub use instance::{ActivityInstanceState, InstanceId};
pub use location::{Argument, Variable};
