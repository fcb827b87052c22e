//! Host-facing workflow API
//!
//! A [`WorkflowHost`] owns one executor behind a mutex and exposes the
//! operations an application performs on a workflow instance: run, resume
//! bookmarks, cancel, persist, unload and load. Every boundary is bounded
//! by the timeouts in [`RuntimeConfig`](super::RuntimeConfig) and every
//! failure carries the workflow instance id.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::activity::WorkflowDefinition;
use super::bookmark::{Bookmark, BookmarkRecord, BookmarkResumptionResult};
use super::dispatcher::{DefaultDispatcher, Dispatcher, InlineDispatcher};
use super::error::{BookmarkError, HostError, PersistenceError, Result};
use super::executor::{Executor, WorkflowOutcome};
use super::instance::InstanceId;
use super::registry::RuntimeCatalog;
use super::snapshot::WorkflowSnapshot;
use super::storage::InstanceStore;
use super::{DispatcherMode, RuntimeConfig};

/// Host-assigned identity of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowInstanceId(pub Uuid);

impl WorkflowInstanceId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowInstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a hosted workflow stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// Root not scheduled yet
    NotStarted,
    /// Nothing queued; waiting on bookmarks
    Idle {
        /// Bookmarks that keep the instance from completing
        blocking: usize,
        /// Bookmarks that do not
        non_blocking: usize,
        /// Whether a snapshot may be taken now
        can_persist: bool,
    },
    /// Root closed
    Closed,
    /// Root canceled
    Canceled,
    /// Root faulted
    Faulted {
        /// Instance that raised the fault
        source: InstanceId,
        /// Fault message
        message: String,
    },
}

impl HostStatus {
    /// Whether the root finished
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            HostStatus::Closed | HostStatus::Canceled | HostStatus::Faulted { .. }
        )
    }

    fn of(executor: &Executor) -> Self {
        match executor.outcome() {
            Some(WorkflowOutcome::Closed { .. }) => HostStatus::Closed,
            Some(WorkflowOutcome::Canceled) => HostStatus::Canceled,
            Some(WorkflowOutcome::Faulted(fault)) => HostStatus::Faulted {
                source: fault.source,
                message: fault.message(),
            },
            None if !executor.is_started() => HostStatus::NotStarted,
            None => HostStatus::Idle {
                blocking: executor.bookmarks().blocking_count(),
                non_blocking: executor.bookmarks().non_blocking_count(),
                can_persist: executor.can_persist(),
            },
        }
    }
}

struct HostInner {
    id: WorkflowInstanceId,
    executor: Mutex<Executor>,
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<dyn InstanceStore>,
    config: RuntimeConfig,
}

/// Shared handle to one hosted workflow instance
#[derive(Clone)]
pub struct WorkflowHost {
    inner: Arc<HostInner>,
}

impl WorkflowHost {
    /// Host a fresh instance of `definition`
    pub fn new(definition: Arc<WorkflowDefinition>, store: Arc<dyn InstanceStore>, config: RuntimeConfig) -> Self {
        Self::from_executor(WorkflowInstanceId::new(), Executor::new(definition), store, config)
    }

    /// Host a preconfigured executor
    pub fn from_executor(
        id: WorkflowInstanceId,
        executor: Executor,
        store: Arc<dyn InstanceStore>,
        config: RuntimeConfig,
    ) -> Self {
        let dispatcher: Arc<dyn Dispatcher> = match config.dispatcher {
            DispatcherMode::Default => DefaultDispatcher::global(),
            DispatcherMode::Inline => Arc::new(InlineDispatcher),
        };
        Self {
            inner: Arc::new(HostInner {
                id,
                executor: Mutex::new(executor),
                dispatcher,
                store,
                config,
            }),
        }
    }

    /// Load a persisted instance and check it against `definition`
    pub fn load(
        id: WorkflowInstanceId,
        definition: Arc<WorkflowDefinition>,
        store: Arc<dyn InstanceStore>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let opened = Instant::now();
        let snapshot = timed(id, "load", config.timeouts.load, || store.load(id))??;

        if snapshot.identity != *definition.identity() {
            return Err(HostError::VersionMismatch {
                instance: id,
                expected: snapshot.identity,
                actual: definition.identity().clone(),
            }
            .into());
        }

        let executor = snapshot.restore(definition, &RuntimeCatalog::global().snapshot())?;
        check_elapsed(id, "open", config.timeouts.open, opened)?;
        tracing::info!(workflow = %id, "instance loaded");
        Ok(Self::from_executor(id, executor, store, config))
    }

    /// Workflow instance id
    pub fn id(&self) -> WorkflowInstanceId {
        self.inner.id
    }

    /// Host configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Executor>> {
        let timeout = self.inner.config.timeouts.acquire_lock;
        self.inner.executor.try_lock_for(timeout).ok_or_else(|| {
            HostError::Timeout {
                instance: self.inner.id,
                operation: "acquire_lock",
                timeout,
            }
            .into()
        })
    }

    /// Start the root with `inputs` and run until idle
    pub fn run(&self, inputs: BTreeMap<String, Value>) -> Result<HostStatus> {
        let mut executor = self.lock()?;
        if !executor.is_started() {
            executor.start(inputs)?;
        }
        self.drive(&mut executor)
    }

    fn drive(&self, executor: &mut Executor) -> Result<HostStatus> {
        let started = Instant::now();
        executor.run_until_idle()?;
        if let Some(limit) = self.inner.config.timeouts.invoke {
            check_elapsed(self.inner.id, "invoke", limit, started)?;
        }

        let wants_persist = executor.persist_requested()
            || (self.inner.config.persist_on_idle && !executor.is_completed());
        if wants_persist {
            if executor.can_persist() {
                self.persist_locked(executor)?;
            } else {
                tracing::debug!(workflow = %self.inner.id, "persist deferred while blocked");
            }
        }
        Ok(HostStatus::of(executor))
    }

    /// Resume a bookmark and run until idle
    pub fn resume_bookmark(&self, bookmark: &Bookmark, payload: Value) -> Result<BookmarkResumptionResult> {
        let mut executor = self.lock()?;
        if executor.is_completed() {
            return Err(HostError::InstanceCompleted(self.inner.id).into());
        }
        if !executor.is_started() {
            return Ok(BookmarkResumptionResult::NotReady);
        }
        match executor.resume_bookmark(bookmark, payload) {
            Ok(()) => {
                self.drive(&mut executor)?;
                Ok(BookmarkResumptionResult::Success)
            }
            Err(BookmarkError::NotFound(_)) => Ok(BookmarkResumptionResult::NotFound),
            Err(BookmarkError::OwnerNotExecuting { .. }) => Ok(BookmarkResumptionResult::NotReady),
            Err(err) => Err(err.into()),
        }
    }

    /// Resume a bookmark on the host's dispatcher, bounded by the resume timeout
    pub async fn resume_bookmark_async(&self, bookmark: Bookmark, payload: Value) -> Result<BookmarkResumptionResult> {
        let (tx, rx) = oneshot::channel();
        let host = self.clone();
        self.inner.dispatcher.post(Box::new(move || {
            let _ = tx.send(host.resume_bookmark(&bookmark, payload));
        }));

        let timeout = self.inner.config.timeouts.resume_bookmark;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Aborted {
                instance: self.inner.id,
                reason: "resumption dropped by dispatcher".into(),
            }
            .into()),
            Err(_) => Err(HostError::Timeout {
                instance: self.inner.id,
                operation: "resume_bookmark",
                timeout,
            }
            .into()),
        }
    }

    /// Cancel the root and run until idle
    pub fn cancel(&self) -> Result<HostStatus> {
        let mut executor = self.lock()?;
        if executor.is_completed() {
            return Err(HostError::InstanceCompleted(self.inner.id).into());
        }
        executor.cancel_root()?;
        self.drive(&mut executor)
    }

    /// Save a snapshot now; fails while persistence is blocked
    pub fn persist(&self) -> Result<()> {
        let mut executor = self.lock()?;
        self.persist_locked(&mut executor)
    }

    fn persist_locked(&self, executor: &mut Executor) -> Result<()> {
        let snapshot = WorkflowSnapshot::capture(executor, self.inner.id)?;
        timed(self.inner.id, "save", self.inner.config.timeouts.save, || {
            self.inner.store.save(&snapshot)
        })??;
        executor.clear_persist_request();
        tracing::debug!(workflow = %self.inner.id, instances = snapshot.instance_count(), "instance persisted");
        Ok(())
    }

    /// Persist and release the instance; fails while work is queued
    pub fn unload(&self) -> Result<WorkflowInstanceId> {
        let started = Instant::now();
        let mut executor = self.lock()?;
        let pending = executor.pending_work();
        if pending > 0 {
            return Err(PersistenceError::Busy(pending).into());
        }
        self.persist_locked(&mut executor)?;
        check_elapsed(self.inner.id, "close", self.inner.config.timeouts.close, started)?;
        tracing::info!(workflow = %self.inner.id, "instance unloaded");
        Ok(self.inner.id)
    }

    /// Current status
    pub fn status(&self) -> Result<HostStatus> {
        let executor = self.lock()?;
        Ok(HostStatus::of(&executor))
    }

    /// Registered bookmarks
    pub fn bookmarks(&self) -> Result<Vec<BookmarkRecord>> {
        Ok(self.lock()?.bookmarks().records().cloned().collect())
    }

    /// Final outcome, once the root finished
    pub fn outcome(&self) -> Result<Option<WorkflowOutcome>> {
        Ok(self.lock()?.outcome().cloned())
    }

    /// Root outputs; the completion fault surfaces as an error
    pub fn outputs(&self) -> Result<Option<BTreeMap<String, Value>>> {
        match self.outcome()? {
            None => Ok(None),
            Some(WorkflowOutcome::Closed { outputs }) => Ok(Some(outputs)),
            Some(WorkflowOutcome::Canceled) => Err(HostError::Aborted {
                instance: self.inner.id,
                reason: "canceled".into(),
            }
            .into()),
            Some(WorkflowOutcome::Faulted(fault)) => Err(HostError::Faulted {
                instance: self.inner.id,
                source_instance: fault.source,
                message: fault.message(),
            }
            .into()),
        }
    }

    /// Values of Mapped variables across live instances, keyed `activity/name`
    pub fn mapped_variables(&self) -> Result<BTreeMap<String, Value>> {
        let executor = self.lock()?;
        let tree = executor.tree();
        let mut mapped = BTreeMap::new();
        for id in tree.ids() {
            let instance = tree.get(id)?;
            let activity = instance.activity();
            for (index, location) in activity.locations().iter().enumerate() {
                if !location.modifiers().is_mapped() {
                    continue;
                }
                if let Some(value) = instance.environment().get(index) {
                    mapped.insert(
                        format!("{}/{}", activity.display_name(), location.name()),
                        value.clone(),
                    );
                }
            }
        }
        Ok(mapped)
    }

    /// Run `f` with exclusive access to the executor
    pub fn with_executor<R>(&self, f: impl FnOnce(&mut Executor) -> R) -> Result<R> {
        let mut executor = self.lock()?;
        Ok(f(&mut executor))
    }
}

impl fmt::Debug for WorkflowHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHost")
            .field("id", &self.inner.id)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

fn check_elapsed(instance: WorkflowInstanceId, operation: &'static str, timeout: Duration, started: Instant) -> Result<()> {
    if started.elapsed() > timeout {
        return Err(HostError::Timeout {
            instance,
            operation,
            timeout,
        }
        .into());
    }
    Ok(())
}

fn timed<T>(instance: WorkflowInstanceId, operation: &'static str, timeout: Duration, f: impl FnOnce() -> T) -> Result<T> {
    let started = Instant::now();
    let value = f();
    check_elapsed(instance, operation, timeout, started)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_parses_display_form() {
        let id = WorkflowInstanceId::new();
        let parsed: WorkflowInstanceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<WorkflowInstanceId>().is_err());
    }

    #[test]
    fn test_instance_id_serializes_as_string() {
        let id = WorkflowInstanceId::new();
        assert_eq!(serde_json::to_value(id).unwrap(), Value::String(id.to_string()));
    }

    #[test]
    fn test_elapsed_check_reports_operation() {
        let id = WorkflowInstanceId::new();
        let started = Instant::now() - Duration::from_millis(50);
        let err = check_elapsed(id, "save", Duration::from_millis(1), started).unwrap_err();
        assert!(matches!(
            err,
            crate::runtime::error::RuntimeError::Host(HostError::Timeout { operation: "save", .. })
        ));
    }
}
