//! Handle lifecycle
//!
//! A handle is a capability bound to one owner instance. It starts out
//! uninitialized; [`initialize`] binds the owner and then runs the
//! handle's `on_initialize` hook, [`uninitialize`] runs `on_uninitialize`
//! and then clears the binding. Every handle operation checks the binding
//! first, so a handle used before initialization and one used after
//! teardown fail the same way.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::error::{ContractError, ContractResult};
use super::instance::{InstanceId, InstanceTree};
use super::no_persist::{NoPersistGate, PersistenceBlockers};
use super::properties::{self, AsAny, ExecutionProperty, PropertyOptions, RegistrationContext};

/// Persisted owner binding of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleBinding {
    /// Owning instance; `None` when never bound
    pub owner: Option<InstanceId>,
    /// Whether the handle is currently unusable
    pub is_uninitialized: bool,
}

impl Default for HandleBinding {
    fn default() -> Self {
        Self {
            owner: None,
            is_uninitialized: true,
        }
    }
}

/// Interior binding state embedded in every handle
#[derive(Debug, Default)]
pub struct HandleState {
    binding: Mutex<HandleBinding>,
}

impl HandleState {
    /// Snapshot of the binding
    pub fn binding(&self) -> HandleBinding {
        *self.binding.lock()
    }

    /// Current owner, if initialized
    pub fn owner(&self) -> Option<InstanceId> {
        let binding = self.binding();
        if binding.is_uninitialized {
            None
        } else {
            binding.owner
        }
    }

    /// Whether operations are allowed
    pub fn is_initialized(&self) -> bool {
        self.owner().is_some()
    }

    /// Owner, or the uninitialized error
    pub fn ensure_initialized(&self, type_name: &str) -> ContractResult<InstanceId> {
        self.owner()
            .ok_or_else(|| ContractError::HandleUninitialized(type_name.to_string()))
    }

    fn bind(&self, owner: InstanceId) {
        *self.binding.lock() = HandleBinding {
            owner: Some(owner),
            is_uninitialized: false,
        };
    }

    fn clear(&self) {
        self.binding.lock().is_uninitialized = true;
    }

    pub(crate) fn restore(&self, binding: HandleBinding) {
        *self.binding.lock() = binding;
    }
}

/// Executor state reachable from handle hooks and operations
pub struct HandleContext<'a> {
    owner: InstanceId,
    tree: &'a mut InstanceTree,
    blockers: &'a mut PersistenceBlockers,
}

impl<'a> HandleContext<'a> {
    pub(crate) fn new(owner: InstanceId, tree: &'a mut InstanceTree, blockers: &'a mut PersistenceBlockers) -> Self {
        Self { owner, tree, blockers }
    }

    /// Instance the operation runs for
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Executor no-persist gate
    pub fn no_persist(&mut self) -> &mut NoPersistGate {
        &mut self.blockers.no_persist
    }

    pub(crate) fn blockers(&mut self) -> &mut PersistenceBlockers {
        self.blockers
    }

    /// Register a property at the owner's scope
    pub fn add_property(
        &mut self,
        name: &str,
        value: Arc<dyn ExecutionProperty>,
        options: PropertyOptions,
    ) -> ContractResult<()> {
        properties::add(self.tree, self.blockers, self.owner, name, value, options)
    }

    /// Remove a property from the owner's scope
    pub fn remove_property(&mut self, name: &str) -> ContractResult<bool> {
        properties::remove(self.tree, self.blockers, self.owner, name)
    }

    /// Property registered exactly at the owner
    pub fn find_property_at_current_scope(&self, name: &str) -> ContractResult<Option<Arc<dyn ExecutionProperty>>> {
        properties::find_at_current_scope(self.tree, self.owner, name)
    }

    /// Registration context for direct hook calls
    pub fn registration(&mut self) -> RegistrationContext<'_> {
        RegistrationContext::new(self.owner, self.blockers)
    }
}

/// Owner-bound capability
pub trait Handle: AsAny {
    /// Embedded binding state
    fn state(&self) -> &HandleState;

    /// Stable type name used as map key and catalog key
    fn type_name(&self) -> &'static str;

    /// Runs after the owner is bound
    fn on_initialize(&self, _ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        Ok(())
    }

    /// Runs before the binding is cleared
    fn on_uninitialize(&self, _ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        Ok(())
    }

    /// Type-specific data persisted next to the binding
    fn persisted_data(&self) -> Value {
        Value::Null
    }

    /// Runs after an initialized handle is restored from a snapshot
    fn on_restored(&self, _ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        Ok(())
    }
}

/// Handles the runtime can create on demand
pub trait HandleType: Handle + Sized {
    /// Map key and catalog key
    const TYPE_NAME: &'static str;

    /// Fresh uninitialized handle
    fn create() -> Self;
}

/// Bind `handle` to `ctx.owner()` and run its initialize hook
pub fn initialize(handle: &dyn Handle, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
    if handle.state().is_initialized() {
        return Err(ContractError::DuplicateHandle(handle.type_name().to_string()));
    }
    handle.state().bind(ctx.owner());
    handle.on_initialize(ctx)
}

/// Run the uninitialize hook and clear the binding
pub fn uninitialize(handle: &dyn Handle, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
    handle.state().ensure_initialized(handle.type_name())?;
    let result = handle.on_uninitialize(ctx);
    handle.state().clear();
    result
}

/// Downcast a shared handle
pub fn downcast<H: Handle>(handle: Arc<dyn Handle>) -> Option<Arc<H>> {
    handle.as_any_arc().downcast::<H>().ok()
}
