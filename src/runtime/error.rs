//! Error types for the workflow runtime
//!
//! Domain errors are `thiserror` enums grouped by who is at fault:
//! activity authors breaking a runtime contract, hosts resuming unknown
//! bookmarks, persistence being refused, and host-level failures that
//! always carry the workflow instance id. Faults raised by activity code
//! itself are plain `anyhow::Error` values and travel through the tree as
//! [`FaultRecord`](super::instance::FaultRecord)s instead.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::activity::WorkflowIdentity;
use super::host::WorkflowInstanceId;
use super::instance::{ActivityInstanceState, InstanceId};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A programming-contract violation at the call site
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractError),

    /// Bookmark registration or resumption failed
    #[error("Bookmark error: {0}")]
    Bookmark(#[from] BookmarkError),

    /// Persistence was refused or failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Host-level failure
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Programming-contract violations.
///
/// These are raised synchronously at the offending call and are never
/// retried by the runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// A required argument was empty
    #[error("Argument '{0}' must not be empty")]
    MissingArgument(&'static str),

    /// A bitset carried an illegal combination of flags
    #[error("Invalid {kind} flags: {bits:#05b}")]
    InvalidFlags {
        /// Name of the flag type
        kind: &'static str,
        /// Offending bit pattern
        bits: u8,
    },

    /// The context view was used after its activation ended
    #[error("Activity context has been disposed")]
    ContextDisposed,

    /// The context view does not belong to the running activation
    #[error("Activity context for instance {0} is not the current activation")]
    StaleContext(InstanceId),

    /// Operation on a handle that is not initialized
    #[error("Handle '{0}' is not initialized")]
    HandleUninitialized(String),

    /// A handle operation was invoked from an instance that does not own it
    #[error("Handle '{handle}' is owned by {owner}, not {caller}")]
    HandleOwnerMismatch {
        /// Handle type name
        handle: String,
        /// Instance the handle is bound to
        owner: InstanceId,
        /// Instance that attempted the operation
        caller: InstanceId,
    },

    /// A handle of the same type is already registered at this scope
    #[error("Handle '{0}' is already registered at this scope")]
    DuplicateHandle(String),

    /// An execution property with the same name exists at this scope
    #[error("Execution property '{0}' is already registered at this scope")]
    DuplicateProperty(String),

    /// Property name rejected by validation
    #[error("Execution property name '{0}' is invalid")]
    InvalidPropertyName(String),

    /// A host extension of this type is already registered
    #[error("Extension '{0}' is already registered")]
    DuplicateExtension(&'static str),

    /// The instance is not present in the tree
    #[error("Activity instance {0} does not exist")]
    UnknownInstance(InstanceId),

    /// State machine violation
    #[error("Instance {instance} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Instance being transitioned
        instance: InstanceId,
        /// Current state
        from: ActivityInstanceState,
        /// Requested state
        to: ActivityInstanceState,
    },

    /// Completion requested while children are still running
    #[error("Instance {instance} still has {count} executing children")]
    OutstandingChildren {
        /// Instance being completed
        instance: InstanceId,
        /// Number of non-terminal children
        count: usize,
    },

    /// The tree already has a root
    #[error("Workflow root has already been scheduled")]
    RootAlreadyScheduled,

    /// The activity's metadata has not reached a schedulable cache state
    #[error("Activity '{activity}' is not runtime ready (cache state {cache_state})")]
    NotSchedulable {
        /// Activity display name
        activity: String,
        /// Current cache state bits
        cache_state: u8,
    },

    /// Metadata mutation after it was frozen for execution
    #[error("Metadata of activity '{0}' is frozen")]
    MetadataFrozen(String),

    /// The same activity object appears twice in one definition tree
    #[error("Activity '{0}' is declared more than once in the workflow tree")]
    ActivityReused(String),

    /// The same location reference is declared by two activities
    #[error("Location '{0}' is declared by more than one activity")]
    DuplicateDeclaration(String),

    /// More no-persist exits than enters
    #[error("No-persist exit without a matching enter")]
    NoPersistUnderflow,

    /// A location reference could not be resolved from the current scope
    #[error("Location '{0}' is not visible from this scope")]
    LocationNotFound(String),

    /// The location reference has not been assigned an identity yet
    #[error("Location '{0}' has no identity; cache the activity metadata first")]
    LocationUnresolved(String),

    /// Write to a read-only location
    #[error("Location '{0}' is read-only")]
    ReadOnlyLocation(String),

    /// Value does not match the declared location type
    #[error("Location '{name}' holds {expected}: {detail}")]
    TypeMismatch {
        /// Location name
        name: String,
        /// Declared type name
        expected: String,
        /// Conversion failure
        detail: String,
    },

    /// The executor already carries a runtime transaction from another handle/scope
    #[error("A runtime transaction is already set by another handle or scope")]
    TransactionAlreadySet,

    /// The ambient transaction slot at this scope belongs to another handle
    #[error("Runtime transaction handle {handle} does not own the ambient slot of this scope")]
    AmbientSlotNotOwned {
        /// Handle that attempted the set
        handle: Uuid,
    },

    /// Child index out of range for the current activity
    #[error("Activity '{activity}' has no child at index {index}")]
    NoSuchChild {
        /// Activity display name
        activity: String,
        /// Requested index
        index: usize,
    },

    /// The instance is not a child of the current instance
    #[error("Instance {0} is not a child of the current instance")]
    NotAChild(InstanceId),
}

/// Convenience result alias for contract checks
pub type ContractResult<T> = std::result::Result<T, ContractError>;

/// Bookmark-specific errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BookmarkError {
    /// Bookmark not registered
    #[error("Bookmark '{0}' not found")]
    NotFound(String),

    /// The owning instance left the Executing state
    #[error("Bookmark '{bookmark}' belongs to instance {owner}, which is no longer executing")]
    OwnerNotExecuting {
        /// Bookmark display form
        bookmark: String,
        /// Owning instance
        owner: InstanceId,
    },

    /// Empty name or zero id
    #[error("Bookmark identity must be a non-empty name or a non-zero id")]
    Degenerate,

    /// Named bookmark already registered
    #[error("Bookmark '{0}' already exists")]
    AlreadyExists(String),
}

/// Convenience result alias for bookmark operations
pub type BookmarkResult<T> = std::result::Result<T, BookmarkError>;

/// Persistence-specific errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Persistence is currently blocked by no-persist regions or a runtime transaction
    #[error("Persistence blocked ({no_persist_count} no-persist entries, runtime transaction: {runtime_transaction})")]
    Blocked {
        /// Outstanding no-persist entries
        no_persist_count: u32,
        /// Whether an ambient runtime transaction is active
        runtime_transaction: bool,
    },

    /// Work is still queued and the instance cannot be unloaded
    #[error("Instance has {0} pending work items")]
    Busy(usize),

    /// No snapshot stored for the id
    #[error("No persisted instance '{0}'")]
    NotFound(WorkflowInstanceId),

    /// Handle type missing from the runtime catalog
    #[error("Unknown handle type '{0}'")]
    UnknownHandleType(String),

    /// Property kind missing from the runtime catalog
    #[error("Unknown execution property kind '{0}'")]
    UnknownPropertyKind(String),

    /// Snapshot does not describe a consistent tree
    #[error("Corrupted snapshot: {0}")]
    Corrupt(String),

    /// Underlying storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for persistence operations
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Host-level failures, always tagged with the workflow instance
#[derive(Debug, Error)]
pub enum HostError {
    /// A boundary operation exceeded its timeout
    #[error("Instance {instance}: {operation} timed out after {timeout:?}")]
    Timeout {
        /// Workflow instance
        instance: WorkflowInstanceId,
        /// Operation name
        operation: &'static str,
        /// Configured timeout
        timeout: Duration,
    },

    /// The persisted instance was created from a different definition
    #[error("Instance {instance}: definition mismatch (expected {expected}, got {actual})")]
    VersionMismatch {
        /// Workflow instance
        instance: WorkflowInstanceId,
        /// Identity recorded with the persisted instance
        expected: WorkflowIdentity,
        /// Identity of the definition supplied for loading
        actual: WorkflowIdentity,
    },

    /// The instance already reached a terminal outcome
    #[error("Instance {0} has already completed")]
    InstanceCompleted(WorkflowInstanceId),

    /// The instance has not been started
    #[error("Instance {0} has not been started")]
    NotStarted(WorkflowInstanceId),

    /// The host gave up on the instance
    #[error("Instance {instance} aborted: {reason}")]
    Aborted {
        /// Workflow instance
        instance: WorkflowInstanceId,
        /// Reason for aborting
        reason: String,
    },

    /// The workflow completed with an unhandled fault
    #[error("Instance {instance} faulted in activity instance {source_instance}: {message}")]
    Faulted {
        /// Workflow instance
        instance: WorkflowInstanceId,
        /// Activity instance that raised the fault
        source_instance: InstanceId,
        /// Fault message
        message: String,
    },
}

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
