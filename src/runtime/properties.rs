//! Execution property scope chain
//!
//! Every instance owns a [`PropertyScope`]. Lookups start at the requesting
//! instance and walk its parent links; an entry registered without
//! `visible_to_children` is only seen from the instance that added it.
//! Scopes are torn down in reverse registration order when their instance
//! completes, running each entry's unregister hook.

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::error::{ContractError, ContractResult};
use super::instance::{InstanceId, InstanceTree};
use super::no_persist::{NoPersistGate, PersistenceBlockers};
use super::transaction::RuntimeTransactionData;

/// Prefix reserved for runtime-owned property names
pub const RESERVED_PREFIX: &str = "runtime.";

/// Downcasting support for trait objects stored by the runtime
pub trait AsAny: Any + Send + Sync {
    /// Borrow as `Any`
    fn as_any(&self) -> &dyn Any;
    /// Convert a shared pointer to `Any`
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Access to executor state from registration hooks
pub struct RegistrationContext<'a> {
    instance: InstanceId,
    blockers: &'a mut PersistenceBlockers,
}

impl<'a> RegistrationContext<'a> {
    pub(crate) fn new(instance: InstanceId, blockers: &'a mut PersistenceBlockers) -> Self {
        Self { instance, blockers }
    }

    /// Instance whose scope is changing
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Executor no-persist gate
    pub fn no_persist(&mut self) -> &mut NoPersistGate {
        &mut self.blockers.no_persist
    }

    /// Executor runtime transaction record
    pub fn runtime_transaction(&mut self) -> &mut Option<RuntimeTransactionData> {
        &mut self.blockers.runtime_transaction
    }
}

/// A named object registered in an instance scope
pub trait ExecutionProperty: AsAny {
    /// Called before the entry becomes visible
    fn on_register(&self, _ctx: &mut RegistrationContext<'_>) -> ContractResult<()> {
        Ok(())
    }

    /// Called when the entry is removed or its scope torn down
    fn on_unregister(&self, _ctx: &mut RegistrationContext<'_>) -> ContractResult<()> {
        Ok(())
    }

    /// Catalog kind and state for persistence; `None` is not persisted
    fn persisted_state(&self) -> Option<(&'static str, Value)> {
        None
    }
}

/// Registration switches.
///
/// `visible_to_children` and `skip_validations` are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyOptions {
    /// Descendants see the entry
    pub visible_to_children: bool,
    /// Skip name validation (reserved prefix)
    pub skip_validations: bool,
}

impl Default for PropertyOptions {
    fn default() -> Self {
        Self {
            visible_to_children: true,
            skip_validations: false,
        }
    }
}

impl PropertyOptions {
    /// Visible only at the registering instance
    pub fn local() -> Self {
        Self {
            visible_to_children: false,
            ..Self::default()
        }
    }

    pub(crate) fn runtime(visible_to_children: bool) -> Self {
        Self {
            visible_to_children,
            skip_validations: true,
        }
    }
}

/// One scope entry
#[derive(Clone)]
pub struct PropertyEntry {
    name: String,
    value: Arc<dyn ExecutionProperty>,
    visible_to_children: bool,
}

impl PropertyEntry {
    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered object
    pub fn value(&self) -> &Arc<dyn ExecutionProperty> {
        &self.value
    }

    /// Whether descendants see it
    pub fn visible_to_children(&self) -> bool {
        self.visible_to_children
    }
}

impl fmt::Debug for PropertyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyEntry")
            .field("name", &self.name)
            .field("visible_to_children", &self.visible_to_children)
            .finish_non_exhaustive()
    }
}

/// Properties registered at one instance, in registration order
#[derive(Debug, Default, Clone)]
pub struct PropertyScope {
    entries: Vec<PropertyEntry>,
}

impl PropertyScope {
    /// Entry by name
    pub fn get(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Entries in registration order
    pub fn entries(&self) -> &[PropertyEntry] {
        &self.entries
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, name: String, value: Arc<dyn ExecutionProperty>, visible_to_children: bool) {
        self.entries.push(PropertyEntry {
            name,
            value,
            visible_to_children,
        });
    }

    fn take(&mut self, name: &str) -> Option<PropertyEntry> {
        let index = self.entries.iter().position(|entry| entry.name == name)?;
        Some(self.entries.remove(index))
    }
}

fn validate_name(name: &str, options: PropertyOptions) -> ContractResult<()> {
    if name.is_empty() {
        return Err(ContractError::MissingArgument("name"));
    }
    if !options.skip_validations && name.starts_with(RESERVED_PREFIX) {
        return Err(ContractError::InvalidPropertyName(name.to_string()));
    }
    Ok(())
}

/// Register `value` under `name` at `instance`
pub(crate) fn add(
    tree: &mut InstanceTree,
    blockers: &mut PersistenceBlockers,
    instance: InstanceId,
    name: &str,
    value: Arc<dyn ExecutionProperty>,
    options: PropertyOptions,
) -> ContractResult<()> {
    validate_name(name, options)?;
    if tree.get(instance)?.properties.get(name).is_some() {
        return Err(ContractError::DuplicateProperty(name.to_string()));
    }

    value.on_register(&mut RegistrationContext::new(instance, blockers))?;
    tree.get_mut(instance)?
        .properties
        .push(name.to_string(), value, options.visible_to_children);
    tracing::trace!(%instance, property = name, "registered execution property");
    Ok(())
}

/// Nearest entry visible from `instance`
pub fn find(
    tree: &InstanceTree,
    instance: InstanceId,
    name: &str,
) -> ContractResult<Option<Arc<dyn ExecutionProperty>>> {
    for (depth, current) in tree.chain(instance)?.into_iter().enumerate() {
        let found = tree
            .get(current)?
            .properties
            .get(name)
            .filter(|entry| depth == 0 || entry.visible_to_children);
        if let Some(entry) = found {
            return Ok(Some(Arc::clone(&entry.value)));
        }
    }
    Ok(None)
}

/// Entry registered exactly at `instance`
pub fn find_at_current_scope(
    tree: &InstanceTree,
    instance: InstanceId,
    name: &str,
) -> ContractResult<Option<Arc<dyn ExecutionProperty>>> {
    Ok(tree
        .get(instance)?
        .properties
        .get(name)
        .map(|entry| Arc::clone(&entry.value)))
}

/// Downcast a found property
pub fn downcast<T: ExecutionProperty>(property: Arc<dyn ExecutionProperty>) -> Option<Arc<T>> {
    property.as_any_arc().downcast::<T>().ok()
}

/// Remove `name` from `instance`, running its unregister hook
pub(crate) fn remove(
    tree: &mut InstanceTree,
    blockers: &mut PersistenceBlockers,
    instance: InstanceId,
    name: &str,
) -> ContractResult<bool> {
    let Some(entry) = tree.get_mut(instance)?.properties.take(name) else {
        return Ok(false);
    };
    entry
        .value
        .on_unregister(&mut RegistrationContext::new(instance, blockers))?;
    Ok(true)
}

/// Tear down a detached scope, last registration first.
///
/// Hook failures are logged and teardown continues.
pub(crate) fn unregister_scope(scope: PropertyScope, blockers: &mut PersistenceBlockers, instance: InstanceId) {
    for entry in scope.entries.into_iter().rev() {
        if let Err(err) = entry
            .value
            .on_unregister(&mut RegistrationContext::new(instance, blockers))
        {
            tracing::warn!(%instance, property = %entry.name, error = %err, "unregister hook failed");
        }
    }
}
