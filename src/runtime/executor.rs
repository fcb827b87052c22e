//! Workflow executor
//!
//! Owns the instance tree, bookmarks, scheduler, persistence blockers and
//! extensions of one running workflow and drives work items through
//! activity behaviours one activation at a time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::activity::{Activity, WorkflowDefinition};
use super::bookmark::{Bookmark, BookmarkManager};
use super::context::{ContextKind, ContextPool, FaultContext, NativeActivityContext, ScheduleOptions, TransactionContext};
use super::error::{BookmarkResult, ContractError, ContractResult};
use super::extensions::WorkflowExtensions;
use super::flags::CacheState;
use super::handle::{self, HandleContext};
use super::instance::{ActivityInstanceState, CompletedChild, FaultRecord, InstanceId, InstanceTree};
use super::location::Environment;
use super::no_persist::PersistenceBlockers;
use super::parallel::{BranchTokenSource, random_tokens};
use super::properties;
use super::scheduler::{Scheduler, WorkItem};
use super::tracking::{TrackingKind, TrackingRecord, TrackingSink};

/// How the workflow ended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    /// Root closed normally
    Closed {
        /// Root Out/InOut argument values
        outputs: BTreeMap<String, Value>,
    },
    /// Root was canceled
    Canceled,
    /// An unhandled fault reached the root
    Faulted(FaultRecord),
}

impl WorkflowOutcome {
    /// Terminal state of the root
    pub fn state(&self) -> ActivityInstanceState {
        match self {
            WorkflowOutcome::Closed { .. } => ActivityInstanceState::Closed,
            WorkflowOutcome::Canceled => ActivityInstanceState::Canceled,
            WorkflowOutcome::Faulted(_) => ActivityInstanceState::Faulted,
        }
    }
}

/// What `finish_instance` hands back to notify the parent
struct Finished {
    parent: Option<InstanceId>,
    completion: Option<String>,
    fault_callback: Option<String>,
    child: CompletedChild,
}

/// Single-threaded driver for one workflow instance
pub struct Executor {
    definition: Arc<WorkflowDefinition>,
    pub(crate) tree: InstanceTree,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) scheduler: Scheduler,
    pub(crate) blockers: PersistenceBlockers,
    pub(crate) extensions: WorkflowExtensions,
    sinks: Vec<Arc<dyn TrackingSink>>,
    contexts: ContextPool,
    pub(crate) current: Option<(InstanceId, u64)>,
    pub(crate) activations: u64,
    pub(crate) persist_requested: bool,
    pub(crate) outcome: Option<WorkflowOutcome>,
    pub(crate) branch_tokens: BranchTokenSource,
}

impl Executor {
    /// Executor for `definition`, not yet started
    pub fn new(definition: Arc<WorkflowDefinition>) -> Self {
        Self {
            definition,
            tree: InstanceTree::new(),
            bookmarks: BookmarkManager::new(),
            scheduler: Scheduler::new(),
            blockers: PersistenceBlockers::default(),
            extensions: WorkflowExtensions::new(),
            sinks: Vec::new(),
            contexts: ContextPool::default(),
            current: None,
            activations: 0,
            persist_requested: false,
            outcome: None,
            branch_tokens: random_tokens(),
        }
    }

    /// Use `extensions` for activity code
    pub fn with_extensions(mut self, extensions: WorkflowExtensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Add a tracking sink
    pub fn with_tracking_sink(mut self, sink: Arc<dyn TrackingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replace the generator of parallel branch tokens
    pub fn with_branch_token_source(mut self, source: BranchTokenSource) -> Self {
        self.branch_tokens = source;
        self
    }

    /// Workflow definition
    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    /// Instance tree
    pub fn tree(&self) -> &InstanceTree {
        &self.tree
    }

    /// Bookmark table
    pub fn bookmarks(&self) -> &BookmarkManager {
        &self.bookmarks
    }

    /// Persistence blockers
    pub fn blockers(&self) -> &PersistenceBlockers {
        &self.blockers
    }

    /// Extension registry
    pub fn extensions_mut(&mut self) -> &mut WorkflowExtensions {
        &mut self.extensions
    }

    /// Context pool statistics as (created, reused)
    pub fn context_stats(&self) -> (usize, usize) {
        (self.contexts.created(), self.contexts.reused())
    }

    /// Final outcome, once the root finished
    pub fn outcome(&self) -> Option<&WorkflowOutcome> {
        self.outcome.as_ref()
    }

    /// Whether the root was scheduled
    pub fn is_started(&self) -> bool {
        self.tree.root().is_some() || self.outcome.is_some()
    }

    /// Whether the root finished
    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether work is queued
    pub fn has_pending_work(&self) -> bool {
        self.scheduler.has_ready_work()
    }

    /// Number of queued work items
    pub fn pending_work(&self) -> usize {
        self.scheduler.pending_count()
    }

    /// Whether a snapshot may be taken now
    pub fn can_persist(&self) -> bool {
        self.current.is_none() && self.blockers.can_persist()
    }

    /// Whether activity code asked for a persist
    pub fn persist_requested(&self) -> bool {
        self.persist_requested
    }

    /// Clear a pending persist request
    pub fn clear_persist_request(&mut self) {
        self.persist_requested = false;
    }

    /// Schedule the root with values for its In/InOut arguments
    pub fn start(&mut self, inputs: BTreeMap<String, Value>) -> ContractResult<InstanceId> {
        if self.is_started() {
            return Err(ContractError::RootAlreadyScheduled);
        }
        let root = Arc::clone(self.definition.root());
        let bindings: Vec<(String, Value)> = inputs.into_iter().collect();
        let environment = Environment::for_activity(&root, &bindings)?;
        let id = self.tree.create_root(Arc::clone(&root), environment)?;
        tracing::info!(workflow = %self.definition.identity(), root = %id, "workflow started");
        self.emit(id, TrackingKind::StateChanged(ActivityInstanceState::Executing));
        self.scheduler.enqueue(WorkItem::Execute { instance: id });
        Ok(id)
    }

    /// Run one work item; false when the queue is empty
    pub fn step(&mut self) -> ContractResult<bool> {
        let Some(work) = self.scheduler.next_item() else {
            return Ok(false);
        };
        tracing::trace!(clock = work.clock.0, work = work.item.label(), "dispatching");
        self.dispatch(work.item)?;
        Ok(true)
    }

    /// Run work items until the queue drains, returning how many ran
    pub fn run_until_idle(&mut self) -> ContractResult<usize> {
        let mut steps = 0;
        while self.step()? {
            steps += 1;
        }
        tracing::debug!(
            steps,
            bookmarks = self.bookmarks.len(),
            completed = self.is_completed(),
            "executor idle"
        );
        Ok(steps)
    }

    /// Validate a resumption and queue its callback
    pub fn resume_bookmark(&mut self, bookmark: &Bookmark, payload: Value) -> BookmarkResult<()> {
        let record = self.bookmarks.resume(bookmark, &self.tree)?;
        self.scheduler.enqueue(WorkItem::ResumeBookmark {
            owner: record.owner,
            bookmark: record.bookmark,
            callback: record.callback,
            payload,
        });
        Ok(())
    }

    /// Request cancellation of the root
    pub fn cancel_root(&mut self) -> ContractResult<()> {
        match self.tree.root() {
            Some(root) if self.tree.contains(root) => self.request_cancel(root),
            _ => Ok(()),
        }
    }

    /// Flag `instance` for cancellation and queue its cancel callback
    pub fn request_cancel(&mut self, instance: InstanceId) -> ContractResult<()> {
        let node = self.tree.get_mut(instance)?;
        if node.state().is_terminal() || node.cancel_requested {
            return Ok(());
        }
        node.cancel_requested = true;
        tracing::debug!(%instance, "cancellation requested");
        self.scheduler.enqueue(WorkItem::Cancel { instance });
        Ok(())
    }

    pub(crate) fn emit(&self, instance: InstanceId, kind: TrackingKind) {
        if self.sinks.is_empty() {
            return;
        }
        let activity = self
            .tree
            .get(instance)
            .map(|node| node.activity().display_name().to_string())
            .unwrap_or_default();
        let record = TrackingRecord::new(instance, activity, kind);
        for sink in &self.sinks {
            sink.record(&record);
        }
    }

    pub(crate) fn schedule_child(
        &mut self,
        parent: InstanceId,
        activity: &Arc<Activity>,
        options: ScheduleOptions,
    ) -> ContractResult<InstanceId> {
        if !self.definition.contains(activity) {
            return Err(ContractError::NotSchedulable {
                activity: activity.display_name().to_string(),
                cache_state: CacheState::UNCACHED.bits(),
            });
        }
        let environment = Environment::for_activity(activity, &options.arguments)?;
        let child = self.tree.create_child(parent, Arc::clone(activity), environment)?;
        let node = self.tree.get_mut(child)?;
        node.completion = options.completion;
        node.fault_callback = options.fault;

        tracing::debug!(%parent, %child, activity = %activity.display_name(), "child scheduled");
        self.emit(child, TrackingKind::StateChanged(ActivityInstanceState::Executing));
        self.scheduler.enqueue(WorkItem::Execute { instance: child });
        Ok(child)
    }

    fn dispatch(&mut self, item: WorkItem) -> ContractResult<()> {
        let target = item.target();
        if !self.tree.is_executing(target) {
            tracing::trace!(%target, work = item.label(), "dropping work for finished instance");
            return Ok(());
        }
        let behavior = self.tree.get(target)?.activity().behavior();

        let result = match item {
            WorkItem::Execute { instance } => {
                let node = self.tree.get_mut(instance)?;
                if node.cancel_requested {
                    node.marked_canceled = true;
                    return self.after_activation(instance);
                }
                self.activate(instance, ContextKind::Native, |ctx| behavior.execute(ctx)).0
            }
            WorkItem::Cancel { instance } => {
                self.activate(instance, ContextKind::Native, |ctx| behavior.cancel(ctx)).0
            }
            WorkItem::ChildCompleted { parent, callback, child } => match callback {
                Some(callback) => {
                    self.activate(parent, ContextKind::Native, |ctx| {
                        behavior.on_child_completed(ctx, &callback, &child)
                    })
                    .0
                }
                None => Ok(()),
            },
            WorkItem::ResumeBookmark {
                owner,
                bookmark,
                callback,
                payload,
            } => {
                self.emit(owner, TrackingKind::BookmarkResumed(bookmark.clone()));
                match callback {
                    Some(callback) => {
                        self.activate(owner, ContextKind::Native, |ctx| {
                            behavior.on_bookmark_resumed(ctx, &bookmark, &callback, payload)
                        })
                        .0
                    }
                    None => Ok(()),
                }
            }
            WorkItem::TransactionContext {
                owner,
                handle_id,
                callback,
            } => {
                self.activate(owner, ContextKind::Transaction, |ctx| {
                    let mut ctx = TransactionContext::new(ctx, handle_id);
                    behavior.on_transaction_context(&mut ctx, &callback)
                })
                .0
            }
        };

        match result {
            Ok(()) => self.after_activation(target),
            Err(error) => self.raise_fault(target, error),
        }
    }

    /// Open a context for `instance`, run `body`, then dispose the context.
    ///
    /// Returns the body's result and whether a fault callback handled its fault.
    fn activate<F>(&mut self, instance: InstanceId, kind: ContextKind, body: F) -> (anyhow::Result<()>, bool)
    where
        F: FnOnce(&mut NativeActivityContext<'_>) -> anyhow::Result<()>,
    {
        self.activations += 1;
        let activation = self.activations;
        let state = self.contexts.acquire(instance, activation, kind);
        self.current = Some((instance, activation));

        let mut ctx = NativeActivityContext::new(self, state);
        let result = body(&mut ctx);
        let state = ctx.into_state();

        self.current = None;
        let handled = state.fault_handled();
        self.contexts.release(state);
        (result, handled)
    }

    /// Complete `instance` if nothing keeps it alive.
    ///
    /// Live children, bookmarks and queued callbacks for the instance
    /// (child reports, resumptions, transaction contexts) all hold it open.
    fn after_activation(&mut self, instance: InstanceId) -> ContractResult<()> {
        let Ok(node) = self.tree.get(instance) else {
            return Ok(());
        };
        if node.state().is_terminal() || !node.children().is_empty() {
            return Ok(());
        }
        if self.scheduler.has_pending_callback(instance) {
            return Ok(());
        }
        if node.marked_canceled {
            return self.complete_and_notify(instance, ActivityInstanceState::Canceled);
        }
        if !self.bookmarks.has_bookmarks(instance) {
            return self.complete_and_notify(instance, ActivityInstanceState::Closed);
        }
        Ok(())
    }

    fn complete_and_notify(&mut self, instance: InstanceId, state: ActivityInstanceState) -> ContractResult<()> {
        let finished = self.finish_instance(instance, state)?;
        match finished.parent {
            Some(parent) => {
                self.scheduler.enqueue(WorkItem::ChildCompleted {
                    parent,
                    callback: finished.completion,
                    child: finished.child,
                });
            }
            None => {
                let outcome = match state {
                    ActivityInstanceState::Canceled => WorkflowOutcome::Canceled,
                    _ => WorkflowOutcome::Closed {
                        outputs: finished.child.outputs,
                    },
                };
                tracing::info!(workflow = %self.definition.identity(), ?state, "workflow completed");
                self.outcome = Some(outcome);
            }
        }
        Ok(())
    }

    /// Move to a terminal state, release everything scoped to the
    /// instance and remove it from the tree
    fn finish_instance(&mut self, instance: InstanceId, state: ActivityInstanceState) -> ContractResult<Finished> {
        self.tree.complete(instance, state)?;
        self.bookmarks.remove_all_for(instance);

        let handles = std::mem::take(&mut self.tree.get_mut(instance)?.handles);
        for (key, handle) in handles.into_iter().rev() {
            if handle.state().owner() != Some(instance) {
                continue;
            }
            let mut ctx = HandleContext::new(instance, &mut self.tree, &mut self.blockers);
            if let Err(err) = handle::uninitialize(handle.as_ref(), &mut ctx) {
                tracing::warn!(%instance, %key, error = %err, "handle uninitialize failed");
            }
        }

        let scope = std::mem::take(&mut self.tree.get_mut(instance)?.properties);
        properties::unregister_scope(scope, &mut self.blockers, instance);

        if self
            .blockers
            .runtime_transaction
            .as_ref()
            .is_some_and(|active| active.owner == instance)
        {
            self.blockers.runtime_transaction = None;
            if let Err(err) = self.blockers.no_persist.exit() {
                tracing::warn!(%instance, error = %err, "runtime transaction release failed");
            }
        }

        self.emit(instance, TrackingKind::StateChanged(state));
        let released = self.tree.release(instance)?;
        let activity = released.activity();
        let child = CompletedChild {
            instance,
            activity: activity.id().unwrap_or_default(),
            display_name: activity.display_name().to_string(),
            state,
            outputs: released.environment().outputs(activity),
        };
        tracing::debug!(%instance, ?state, "instance finished");
        Ok(Finished {
            parent: released.parent(),
            completion: released.completion,
            fault_callback: released.fault_callback,
            child,
        })
    }

    /// Finish every descendant of `instance` as Faulted, deepest first
    fn abort_descendants(&mut self, instance: InstanceId) -> ContractResult<()> {
        for descendant in self.tree.descendants_post_order(instance)? {
            self.finish_instance(descendant, ActivityInstanceState::Faulted)?;
        }
        Ok(())
    }

    /// Propagate an error raised by `source` up the tree until a fault
    /// callback handles it or it reaches the root
    fn raise_fault(&mut self, source: InstanceId, error: anyhow::Error) -> ContractResult<()> {
        let name = self.tree.get(source)?.activity().display_name().to_string();
        let mut record = FaultRecord::new(error, source, name);
        tracing::warn!(%source, fault = %record, "activity faulted");
        self.emit(source, TrackingKind::Fault(record.message()));

        let mut current = source;
        loop {
            self.abort_descendants(current)?;
            let finished = self.finish_instance(current, ActivityInstanceState::Faulted)?;
            let Some(parent) = finished.parent else {
                tracing::error!(workflow = %self.definition.identity(), fault = %record, "workflow faulted");
                self.outcome = Some(WorkflowOutcome::Faulted(record));
                return Ok(());
            };

            if let Some(callback) = finished.fault_callback {
                let behavior = self.tree.get(parent)?.activity().behavior();
                let delivered = record.clone();
                let (result, handled) = self.activate(parent, ContextKind::Fault, |ctx| {
                    let mut ctx = FaultContext::new(ctx, delivered.clone());
                    behavior.on_child_faulted(&mut ctx, &callback, &delivered)
                });
                match result {
                    Ok(()) if handled => {
                        tracing::debug!(%parent, fault = %record, "fault handled");
                        return self.after_activation(parent);
                    }
                    Ok(()) => {}
                    Err(error) => {
                        let name = self.tree.get(parent)?.activity().display_name().to_string();
                        record = FaultRecord::new(error, parent, name);
                        self.emit(parent, TrackingKind::Fault(record.message()));
                    }
                }
            }
            current = parent;
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workflow", self.definition.identity())
            .field("instances", &self.tree.len())
            .field("bookmarks", &self.bookmarks.len())
            .field("pending", &self.scheduler.pending_count())
            .field("outcome", &self.outcome)
            .finish()
    }
}
