//! Activity context family
//!
//! Activity code only ever touches the executor through a context view:
//!
//! - [`CodeActivityContext`]: locations and tracking only
//! - [`NativeActivityContext`]: adds bookmarks, child scheduling,
//!   no-persist regions, handles, properties, extensions, parallel
//!   branches and cancellation
//! - [`FaultContext`]: a native view handed to fault callbacks, with
//!   `handle_fault`
//! - [`TransactionContext`]: a native view handed to transaction
//!   callbacks, with `set_runtime_transaction`
//!
//! Views borrow the executor for one activation. Their bookkeeping lives
//! in a pooled [`ContextState`] that is reset on every acquisition, and
//! every operation checks that the view is neither disposed nor stale.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use uuid::Uuid;

use super::activity::Activity;
use super::bookmark::Bookmark;
use super::error::{ContractError, ContractResult, Result};
use super::executor::Executor;
use super::flags::BookmarkOptions;
use super::handle::{self, Handle, HandleContext, HandleType};
use super::instance::{FaultRecord, InstanceId};
use super::location::{self, Environment, ResolvedLocation, TypedLocation};
use super::no_persist::NoPersistHandle;
use super::parallel::{PARALLEL_BRANCH_PROPERTY, ParallelBranch, ParallelBranchProperty};
use super::properties::{self, ExecutionProperty, PropertyOptions};
use super::scheduler::WorkItem;
use super::tracking::TrackingKind;
use super::transaction::{AMBIENT_TRANSACTION_PROPERTY, AmbientTransactionProperty, RuntimeTransactionHandle, Transaction};

/// Which view an activation was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// `execute`, `cancel`, completion and bookmark callbacks
    Native,
    /// Fault callbacks
    Fault,
    /// Transaction callbacks
    Transaction,
}

/// Pooled per-activation bookkeeping
#[derive(Debug)]
pub struct ContextState {
    instance: InstanceId,
    activation: u64,
    kind: ContextKind,
    disposed: bool,
    fault_handled: bool,
}

impl ContextState {
    fn new(instance: InstanceId, activation: u64, kind: ContextKind) -> Self {
        Self {
            instance,
            activation,
            kind,
            disposed: false,
            fault_handled: false,
        }
    }

    /// Reset every field for a new activation
    fn reinitialize(&mut self, instance: InstanceId, activation: u64, kind: ContextKind) {
        *self = Self::new(instance, activation, kind);
    }

    /// Instance the view was opened for
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Activation number
    pub fn activation(&self) -> u64 {
        self.activation
    }

    /// View kind
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Whether the view was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Whether a fault callback consumed the fault
    pub fn fault_handled(&self) -> bool {
        self.fault_handled
    }

    pub(crate) fn dispose(&mut self) {
        self.disposed = true;
    }
}

/// Recycles context state between activations
#[derive(Debug, Default)]
pub struct ContextPool {
    free: Vec<ContextState>,
    created: usize,
    reused: usize,
}

impl ContextPool {
    /// Fresh or recycled state for an activation
    pub fn acquire(&mut self, instance: InstanceId, activation: u64, kind: ContextKind) -> ContextState {
        match self.free.pop() {
            Some(mut state) => {
                self.reused += 1;
                state.reinitialize(instance, activation, kind);
                state
            }
            None => {
                self.created += 1;
                ContextState::new(instance, activation, kind)
            }
        }
    }

    /// Return state to the pool
    pub fn release(&mut self, mut state: ContextState) {
        state.dispose();
        self.free.push(state);
    }

    /// States allocated
    pub fn created(&self) -> usize {
        self.created
    }

    /// Acquisitions served from the pool
    pub fn reused(&self) -> usize {
        self.reused
    }
}

/// Options for scheduling a child
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Callback run on this activity when the child completes
    pub completion: Option<String>,
    /// Callback run on this activity when the child faults
    pub fault: Option<String>,
    /// Values for the child's In/InOut arguments
    pub arguments: Vec<(String, Value)>,
}

impl ScheduleOptions {
    /// Completion callback only
    pub fn on_complete(callback: impl Into<String>) -> Self {
        Self {
            completion: Some(callback.into()),
            ..Self::default()
        }
    }

    /// Add a fault callback
    pub fn on_fault(mut self, callback: impl Into<String>) -> Self {
        self.fault = Some(callback.into());
        self
    }

    /// Bind an argument value
    pub fn with_argument<V: Serialize>(mut self, name: impl Into<String>, value: V) -> ContractResult<Self> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|err| ContractError::TypeMismatch {
            name: name.clone(),
            expected: std::any::type_name::<V>().to_string(),
            detail: err.to_string(),
        })?;
        self.arguments.push((name, value));
        Ok(self)
    }
}

/// Full view for control-flow activities
pub struct NativeActivityContext<'a> {
    executor: &'a mut Executor,
    state: ContextState,
}

impl<'a> NativeActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut Executor, state: ContextState) -> Self {
        Self { executor, state }
    }

    pub(crate) fn into_state(self) -> ContextState {
        self.state
    }

    fn ensure_active(&self) -> ContractResult<InstanceId> {
        if self.state.disposed {
            return Err(ContractError::ContextDisposed);
        }
        if self.executor.current != Some((self.state.instance, self.state.activation)) {
            return Err(ContractError::StaleContext(self.state.instance));
        }
        Ok(self.state.instance)
    }

    /// End this view early; later calls fail
    pub fn dispose(&mut self) {
        self.state.dispose();
    }

    /// Current instance
    pub fn instance_id(&self) -> ContractResult<InstanceId> {
        self.ensure_active()
    }

    /// Current activity
    pub fn activity(&self) -> ContractResult<Arc<Activity>> {
        let instance = self.ensure_active()?;
        Ok(Arc::clone(self.executor.tree.get(instance)?.activity()))
    }

    // locations

    fn read(&self, resolved: &ResolvedLocation) -> ContractResult<Value> {
        self.executor
            .tree
            .get(resolved.instance)?
            .environment
            .get(resolved.index)
            .cloned()
            .ok_or_else(|| ContractError::LocationNotFound(resolved.reference.name().to_string()))
    }

    fn write(&mut self, resolved: &ResolvedLocation, value: Value) -> ContractResult<()> {
        let environment: &mut Environment = &mut self.executor.tree.get_mut(resolved.instance)?.environment;
        if environment.set(resolved.index, value) {
            Ok(())
        } else {
            Err(ContractError::LocationNotFound(resolved.reference.name().to_string()))
        }
    }

    fn resolve_typed<T>(&self, target: &impl TypedLocation<T>, inherited: bool) -> ContractResult<ResolvedLocation> {
        let instance = self.ensure_active()?;
        location::resolve(&self.executor.tree, instance, target.reference(), inherited)
    }

    /// Read a typed location
    pub fn get<T: DeserializeOwned>(&self, target: &impl TypedLocation<T>) -> ContractResult<T> {
        let resolved = self.resolve_typed(target, false)?;
        location::decode(&resolved.reference, &self.read(&resolved)?)
    }

    /// Write a typed location
    pub fn set<T: Serialize>(&mut self, target: &impl TypedLocation<T>, value: T) -> ContractResult<()> {
        let resolved = self.resolve_typed(target, false)?;
        let value = location::encode(&resolved.reference, value)?;
        self.write(&resolved, value)
    }

    /// Read a typed location, skipping the current instance's own declarations
    pub fn get_inherited<T: DeserializeOwned>(&self, target: &impl TypedLocation<T>) -> ContractResult<T> {
        let resolved = self.resolve_typed(target, true)?;
        location::decode(&resolved.reference, &self.read(&resolved)?)
    }

    /// Write a typed location, skipping the current instance's own declarations
    pub fn set_inherited<T: Serialize>(&mut self, target: &impl TypedLocation<T>, value: T) -> ContractResult<()> {
        let resolved = self.resolve_typed(target, true)?;
        let value = location::encode(&resolved.reference, value)?;
        self.write(&resolved, value)
    }

    /// Read a location by name
    pub fn get_value(&self, name: &str) -> ContractResult<Value> {
        let instance = self.ensure_active()?;
        let resolved = location::resolve_by_name(&self.executor.tree, instance, name, false)?;
        self.read(&resolved)
    }

    /// Write a location by name
    pub fn set_value(&mut self, name: &str, value: Value) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        let resolved = location::resolve_by_name(&self.executor.tree, instance, name, false)?;
        let value = location::encode(&resolved.reference, value)?;
        self.write(&resolved, value)
    }

    /// Read an ancestor's location by name
    pub fn get_inherited_value(&self, name: &str) -> ContractResult<Value> {
        let instance = self.ensure_active()?;
        let resolved = location::resolve_by_name(&self.executor.tree, instance, name, true)?;
        self.read(&resolved)
    }

    /// Read the current activity's location at a declaration index
    pub fn get_value_at(&self, index: usize) -> ContractResult<Value> {
        let resolved = self.positional(index)?;
        self.read(&resolved)
    }

    /// Write the current activity's location at a declaration index
    pub fn set_value_at(&mut self, index: usize, value: Value) -> ContractResult<()> {
        let resolved = self.positional(index)?;
        let value = location::encode(&resolved.reference, value)?;
        self.write(&resolved, value)
    }

    fn positional(&self, index: usize) -> ContractResult<ResolvedLocation> {
        let instance = self.ensure_active()?;
        let activity = self.executor.tree.get(instance)?.activity();
        let reference = activity
            .locations()
            .get(index)
            .cloned()
            .ok_or_else(|| ContractError::LocationNotFound(format!("#{index}")))?;
        Ok(ResolvedLocation {
            instance,
            index,
            reference,
        })
    }

    /// Emit a custom tracking record
    pub fn track(&mut self, name: impl Into<String>, data: Value) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        self.executor.emit(
            instance,
            TrackingKind::Custom {
                name: name.into(),
                data,
            },
        );
        Ok(())
    }

    // bookmarks

    /// Register a named bookmark delivering to `callback`
    pub fn create_bookmark(&mut self, name: &str, callback: &str, options: BookmarkOptions) -> Result<Bookmark> {
        let instance = self.ensure_active()?;
        let bookmark = self
            .executor
            .bookmarks
            .create(instance, Some(name), options, Some(callback.to_string()))?;
        Ok(bookmark)
    }

    /// Register a bookmark with a generated id
    pub fn create_anonymous_bookmark(&mut self, callback: &str, options: BookmarkOptions) -> Result<Bookmark> {
        let instance = self.ensure_active()?;
        let bookmark = self
            .executor
            .bookmarks
            .create(instance, None, options, Some(callback.to_string()))?;
        Ok(bookmark)
    }

    /// Remove a bookmark owned by the current instance
    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> ContractResult<bool> {
        let instance = self.ensure_active()?;
        Ok(self.executor.bookmarks.remove(instance, bookmark))
    }

    /// Remove every bookmark owned by the current instance
    pub fn remove_all_bookmarks(&mut self) -> ContractResult<usize> {
        let instance = self.ensure_active()?;
        Ok(self.executor.bookmarks.remove_all_for(instance))
    }

    // children

    /// Schedule an activity as a child without callbacks
    pub fn schedule_activity(&mut self, activity: &Arc<Activity>) -> ContractResult<InstanceId> {
        self.schedule_activity_with(activity, ScheduleOptions::default())
    }

    /// Schedule an activity as a child
    pub fn schedule_activity_with(&mut self, activity: &Arc<Activity>, options: ScheduleOptions) -> ContractResult<InstanceId> {
        let instance = self.ensure_active()?;
        self.executor.schedule_child(instance, activity, options)
    }

    /// Schedule the current activity's child at `index`
    pub fn schedule_child(&mut self, index: usize, options: ScheduleOptions) -> ContractResult<InstanceId> {
        let current = self.activity()?;
        let child = current
            .children()
            .get(index)
            .cloned()
            .ok_or_else(|| ContractError::NoSuchChild {
                activity: current.display_name().to_string(),
                index,
            })?;
        self.schedule_activity_with(&child, options)
    }

    /// Running children of the current instance
    pub fn children(&self) -> ContractResult<Vec<InstanceId>> {
        let instance = self.ensure_active()?;
        Ok(self.executor.tree.get(instance)?.children().to_vec())
    }

    // cancellation

    /// Request cancellation of one running child
    pub fn cancel_child(&mut self, child: InstanceId) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        if self.executor.tree.parent_of(child)? != Some(instance) {
            return Err(ContractError::NotAChild(child));
        }
        self.executor.request_cancel(child)
    }

    /// Request cancellation of every running child
    pub fn cancel_children(&mut self) -> ContractResult<()> {
        for child in self.children()? {
            self.executor.request_cancel(child)?;
        }
        Ok(())
    }

    /// Complete as Canceled once children are done
    pub fn mark_canceled(&mut self) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        self.executor.tree.get_mut(instance)?.marked_canceled = true;
        Ok(())
    }

    /// Whether cancellation was requested for the current instance
    pub fn is_cancellation_requested(&self) -> ContractResult<bool> {
        let instance = self.ensure_active()?;
        Ok(self.executor.tree.get(instance)?.cancel_requested)
    }

    // persistence

    /// Open a no-persist region at the current instance
    pub fn enter_no_persist(&mut self) -> ContractResult<()> {
        let handle = self.get_or_create_handle::<NoPersistHandle>()?;
        handle.enter(&mut self.handle_context()?)
    }

    /// Close a no-persist region; true when persistence is possible again
    pub fn exit_no_persist(&mut self) -> ContractResult<bool> {
        let handle = self.get_or_create_handle::<NoPersistHandle>()?;
        handle.exit(&mut self.handle_context()?)
    }

    /// Ask the host to persist at the next opportunity
    pub fn request_persist(&mut self) -> ContractResult<()> {
        self.ensure_active()?;
        self.executor.persist_requested = true;
        Ok(())
    }

    // handles

    /// Executor access for handle operations at the current instance
    pub fn handle_context(&mut self) -> ContractResult<HandleContext<'_>> {
        let instance = self.ensure_active()?;
        Ok(HandleContext::new(
            instance,
            &mut self.executor.tree,
            &mut self.executor.blockers,
        ))
    }

    /// Handle of type `H` at the current instance, created and initialized on first use
    pub fn get_or_create_handle<H: HandleType>(&mut self) -> ContractResult<Arc<H>> {
        let instance = self.ensure_active()?;
        if let Some(existing) = self.executor.tree.get(instance)?.handles.get(H::TYPE_NAME) {
            return handle::downcast::<H>(Arc::clone(existing))
                .ok_or_else(|| ContractError::DuplicateHandle(H::TYPE_NAME.to_string()));
        }
        let created = Arc::new(H::create());
        self.add_handle(H::TYPE_NAME, Arc::clone(&created) as Arc<dyn Handle>)?;
        Ok(created)
    }

    /// Register and initialize a handle under an explicit key
    pub fn add_handle(&mut self, key: &str, handle: Arc<dyn Handle>) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        if key.is_empty() {
            return Err(ContractError::MissingArgument("key"));
        }
        if self.executor.tree.get(instance)?.handles.contains_key(key) {
            return Err(ContractError::DuplicateHandle(key.to_string()));
        }
        handle::initialize(handle.as_ref(), &mut self.handle_context()?)?;
        self.executor
            .tree
            .get_mut(instance)?
            .handles
            .insert(key.to_string(), handle);
        Ok(())
    }

    /// Nearest handle of type `H` on the instance chain
    pub fn find_handle<H: HandleType>(&self) -> ContractResult<Option<Arc<H>>> {
        Ok(self
            .find_handle_by_key(H::TYPE_NAME)?
            .and_then(handle::downcast::<H>))
    }

    /// Nearest handle registered under `key` on the instance chain
    pub fn find_handle_by_key(&self, key: &str) -> ContractResult<Option<Arc<dyn Handle>>> {
        let instance = self.ensure_active()?;
        for current in self.executor.tree.chain(instance)? {
            if let Some(found) = self.executor.tree.get(current)?.handles.get(key) {
                return Ok(Some(Arc::clone(found)));
            }
        }
        Ok(None)
    }

    // properties

    /// Register a property at the current instance
    pub fn add_property(
        &mut self,
        name: &str,
        value: Arc<dyn ExecutionProperty>,
        options: PropertyOptions,
    ) -> ContractResult<()> {
        self.handle_context()?.add_property(name, value, options)
    }

    /// Remove a property from the current instance
    pub fn remove_property(&mut self, name: &str) -> ContractResult<bool> {
        self.handle_context()?.remove_property(name)
    }

    /// Nearest visible property
    pub fn find_property(&self, name: &str) -> ContractResult<Option<Arc<dyn ExecutionProperty>>> {
        let instance = self.ensure_active()?;
        properties::find(&self.executor.tree, instance, name)
    }

    /// Property registered exactly at the current instance
    pub fn find_property_at_current_scope(&self, name: &str) -> ContractResult<Option<Arc<dyn ExecutionProperty>>> {
        let instance = self.ensure_active()?;
        properties::find_at_current_scope(&self.executor.tree, instance, name)
    }

    /// Nearest visible property, downcast to `T`
    pub fn find_property_as<T: ExecutionProperty>(&self, name: &str) -> ContractResult<Option<Arc<T>>> {
        Ok(self.find_property(name)?.and_then(properties::downcast::<T>))
    }

    /// Host extension of type `T`
    pub fn extension<T: std::any::Any + Send + Sync>(&self) -> ContractResult<Option<Arc<T>>> {
        self.ensure_active()?;
        Ok(self.executor.extensions.get::<T>())
    }

    // parallel branches

    /// Branch id visible from the current instance; `None` at the root branch
    pub fn current_parallel_branch_id(&self) -> ContractResult<Option<String>> {
        Ok(self
            .find_property_as::<ParallelBranchProperty>(PARALLEL_BRANCH_PROPERTY)?
            .map(|property| property.branch().id().to_string()))
    }

    /// Branch id introduced exactly at the current instance
    pub fn parallel_branch_at_current_scope(&self) -> ContractResult<Option<String>> {
        Ok(self
            .find_property_at_current_scope(PARALLEL_BRANCH_PROPERTY)?
            .and_then(properties::downcast::<ParallelBranchProperty>)
            .map(|property| property.branch().id().to_string()))
    }

    /// Start a new branch below the current one and register it here
    pub fn mark_new_parallel_branch(&mut self) -> ContractResult<String> {
        self.ensure_active()?;
        let parent = self.current_parallel_branch_id()?;
        let token = (self.executor.branch_tokens)();
        let branch = ParallelBranch::child_of(parent.as_deref(), &token);
        let id = branch.id().to_string();
        self.add_property(
            PARALLEL_BRANCH_PROPERTY,
            Arc::new(ParallelBranchProperty::new(branch)),
            PropertyOptions::runtime(true),
        )?;
        tracing::debug!(instance = %self.state.instance, branch = %id, "parallel branch marked");
        Ok(id)
    }

    // transactions

    /// Ambient transaction visible from the current instance
    pub fn ambient_transaction(&self) -> ContractResult<Option<Arc<dyn Transaction>>> {
        Ok(self
            .find_property_as::<AmbientTransactionProperty>(AMBIENT_TRANSACTION_PROPERTY)?
            .and_then(|property| property.transaction()))
    }

    /// Queue a transaction callback for a handle owned by the current instance
    pub fn request_transaction_context(&mut self, handle: &RuntimeTransactionHandle, callback: &str) -> ContractResult<()> {
        let instance = self.ensure_active()?;
        handle.ensure_owned_by(instance)?;
        self.executor.scheduler.enqueue(WorkItem::TransactionContext {
            owner: instance,
            handle_id: handle.id(),
            callback: callback.to_string(),
        });
        Ok(())
    }
}

/// Restricted view for leaf computation
pub struct CodeActivityContext<'c, 'a> {
    inner: &'c mut NativeActivityContext<'a>,
}

impl<'c, 'a> CodeActivityContext<'c, 'a> {
    pub(crate) fn new(inner: &'c mut NativeActivityContext<'a>) -> Self {
        Self { inner }
    }

    /// Current instance
    pub fn instance_id(&self) -> ContractResult<InstanceId> {
        self.inner.instance_id()
    }

    /// Read a typed location
    pub fn get<T: DeserializeOwned>(&self, target: &impl TypedLocation<T>) -> ContractResult<T> {
        self.inner.get(target)
    }

    /// Write a typed location
    pub fn set<T: Serialize>(&mut self, target: &impl TypedLocation<T>, value: T) -> ContractResult<()> {
        self.inner.set(target, value)
    }

    /// Read a typed location from an ancestor
    pub fn get_inherited<T: DeserializeOwned>(&self, target: &impl TypedLocation<T>) -> ContractResult<T> {
        self.inner.get_inherited(target)
    }

    /// Write a typed location of an ancestor
    pub fn set_inherited<T: Serialize>(&mut self, target: &impl TypedLocation<T>, value: T) -> ContractResult<()> {
        self.inner.set_inherited(target, value)
    }

    /// Read by name
    pub fn get_value(&self, name: &str) -> ContractResult<Value> {
        self.inner.get_value(name)
    }

    /// Write by name
    pub fn set_value(&mut self, name: &str, value: Value) -> ContractResult<()> {
        self.inner.set_value(name, value)
    }

    /// Read by declaration index
    pub fn get_value_at(&self, index: usize) -> ContractResult<Value> {
        self.inner.get_value_at(index)
    }

    /// Write by declaration index
    pub fn set_value_at(&mut self, index: usize, value: Value) -> ContractResult<()> {
        self.inner.set_value_at(index, value)
    }

    /// Emit a custom tracking record
    pub fn track(&mut self, name: impl Into<String>, data: Value) -> ContractResult<()> {
        self.inner.track(name, data)
    }
}

/// Native view handed to fault callbacks
pub struct FaultContext<'c, 'a> {
    inner: &'c mut NativeActivityContext<'a>,
    fault: FaultRecord,
}

impl<'c, 'a> FaultContext<'c, 'a> {
    pub(crate) fn new(inner: &'c mut NativeActivityContext<'a>, fault: FaultRecord) -> Self {
        Self { inner, fault }
    }

    /// Consume the fault; propagation stops at this instance
    pub fn handle_fault(&mut self) -> ContractResult<()> {
        self.inner.ensure_active()?;
        self.inner.state.fault_handled = true;
        Ok(())
    }

    /// Copy of the fault being delivered
    pub fn create_fault_record(&self) -> ContractResult<FaultRecord> {
        self.inner.ensure_active()?;
        Ok(self.fault.clone())
    }
}

impl<'c, 'a> Deref for FaultContext<'c, 'a> {
    type Target = NativeActivityContext<'a>;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

impl<'c, 'a> DerefMut for FaultContext<'c, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
    }
}

/// Native view handed to transaction callbacks
pub struct TransactionContext<'c, 'a> {
    inner: &'c mut NativeActivityContext<'a>,
    handle_id: Uuid,
}

impl<'c, 'a> TransactionContext<'c, 'a> {
    pub(crate) fn new(inner: &'c mut NativeActivityContext<'a>, handle_id: Uuid) -> Self {
        Self { inner, handle_id }
    }

    /// Handle the context was requested through
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }

    /// Install the runtime transaction through the requesting handle
    pub fn set_runtime_transaction(&mut self, transaction: Arc<dyn Transaction>) -> ContractResult<()> {
        let instance = self.inner.ensure_active()?;
        let handle = self
            .inner
            .executor
            .tree
            .get(instance)?
            .handles
            .values()
            .filter_map(|handle| handle::downcast::<RuntimeTransactionHandle>(Arc::clone(handle)))
            .find(|handle| handle.id() == self.handle_id)
            .ok_or_else(|| ContractError::HandleUninitialized(RuntimeTransactionHandle::TYPE_NAME.to_string()))?;
        let executor = &mut *self.inner.executor;
        handle.set_transaction(&executor.tree, &mut executor.blockers, instance, transaction)
    }
}

impl<'c, 'a> Deref for TransactionContext<'c, 'a> {
    type Target = NativeActivityContext<'a>;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

impl<'c, 'a> DerefMut for TransactionContext<'c, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::WorkflowDefinition;

    #[test]
    fn test_pool_reuses_and_resets_state() {
        let mut pool = ContextPool::default();
        let a = InstanceId {
            index: 0,
            generation: 0,
        };
        let b = InstanceId {
            index: 1,
            generation: 0,
        };

        let mut state = pool.acquire(a, 1, ContextKind::Fault);
        state.fault_handled = true;
        pool.release(state);

        let state = pool.acquire(b, 2, ContextKind::Native);
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.reused(), 1);
        assert_eq!(state.instance(), b);
        assert_eq!(state.activation(), 2);
        assert_eq!(state.kind(), ContextKind::Native);
        assert!(!state.fault_handled());
        assert!(!state.is_disposed());
    }

    #[test]
    fn test_view_for_another_activation_is_stale() {
        let def = WorkflowDefinition::new("ctx", "1", Activity::code("root", |_ctx| Ok(()))).unwrap();
        let mut executor = Executor::new(def);
        let root = executor.start(Default::default()).unwrap();

        let state = ContextState::new(root, 99, ContextKind::Native);
        let ctx = NativeActivityContext::new(&mut executor, state);
        assert_eq!(ctx.instance_id(), Err(ContractError::StaleContext(root)));
    }

    #[test]
    fn test_disposed_view_rejects_calls() {
        let def = WorkflowDefinition::new("ctx", "1", Activity::code("root", |_ctx| Ok(()))).unwrap();
        let mut executor = Executor::new(def);
        let root = executor.start(Default::default()).unwrap();

        executor.current = Some((root, 7));
        let mut ctx = NativeActivityContext::new(&mut executor, ContextState::new(root, 7, ContextKind::Native));
        assert_eq!(ctx.instance_id(), Ok(root));
        ctx.dispose();
        assert_eq!(ctx.instance_id(), Err(ContractError::ContextDisposed));
        assert_eq!(ctx.mark_canceled(), Err(ContractError::ContextDisposed));
    }

    #[test]
    fn test_unserializable_argument_is_rejected() {
        let options = ScheduleOptions::default().with_argument("n", 3).unwrap();
        assert_eq!(options.arguments, [("n".to_string(), serde_json::json!(3))]);

        let keyed_by_tuple = std::collections::BTreeMap::from([((1, 2), 3)]);
        let err = ScheduleOptions::default().with_argument("grid", keyed_by_tuple).unwrap_err();
        assert!(matches!(err, ContractError::TypeMismatch { ref name, .. } if name == "grid"));
    }
}
