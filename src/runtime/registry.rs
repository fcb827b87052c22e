//! Handle and property type registry
//!
//! Provides a global catalog of factories that rebuild handles and
//! execution properties from their persisted form. Register custom types
//! before loading a persisted instance; each load clones an immutable
//! snapshot of the catalog so a running restore never sees a half-updated
//! table.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

use super::error::{PersistenceError, PersistenceResult};
use super::handle::{Handle, HandleType};
use super::no_persist::NoPersistHandle;
use super::parallel::{PARALLEL_BRANCH_KIND, ParallelBranch, ParallelBranchProperty};
use super::properties::ExecutionProperty;
use super::transaction::RuntimeTransactionHandle;

/// Factory rebuilding a handle from its persisted data
pub type HandleFactory = Arc<dyn Fn(&Value) -> PersistenceResult<Arc<dyn Handle>> + Send + Sync>;

/// Factory rebuilding a property from its persisted state
pub type PropertyFactory = Arc<dyn Fn(&Value) -> PersistenceResult<Arc<dyn ExecutionProperty>> + Send + Sync>;

/// Global catalog of restorable runtime types.
pub struct RuntimeCatalog {
    handles: RwLock<HashMap<String, HandleFactory>>,
    properties: RwLock<HashMap<String, PropertyFactory>>,
}

static CATALOG: LazyLock<RuntimeCatalog> = LazyLock::new(RuntimeCatalog::with_builtins);

impl RuntimeCatalog {
    fn with_builtins() -> Self {
        let catalog = Self {
            handles: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
        };
        catalog.register_default_handle::<NoPersistHandle>();
        catalog.register_handle(RuntimeTransactionHandle::TYPE_NAME, |data| {
            let id = data
                .get("id")
                .cloned()
                .ok_or_else(|| PersistenceError::Corrupt("runtime transaction handle without id".into()))?;
            let id: Uuid = serde_json::from_value(id)
                .map_err(|err| PersistenceError::Corrupt(format!("runtime transaction handle id: {err}")))?;
            Ok(Arc::new(RuntimeTransactionHandle::with_id(id)) as Arc<dyn Handle>)
        });
        catalog.register_property(PARALLEL_BRANCH_KIND, |state| {
            let id = state
                .as_str()
                .ok_or_else(|| PersistenceError::Corrupt(format!("parallel branch state {state}")))?;
            Ok(Arc::new(ParallelBranchProperty::new(ParallelBranch::from_id(id))) as Arc<dyn ExecutionProperty>)
        });
        catalog
    }

    /// Access the global catalog singleton.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a handle type with a factory function.
    pub fn register_handle<F>(&self, type_name: &str, factory: F)
    where
        F: Fn(&Value) -> PersistenceResult<Arc<dyn Handle>> + Send + Sync + 'static,
    {
        self.handles.write().insert(type_name.to_string(), Arc::new(factory));
    }

    /// Register a handle type that carries no persisted data.
    pub fn register_default_handle<H: HandleType>(&self) {
        self.register_handle(H::TYPE_NAME, |_data| Ok(Arc::new(H::create()) as Arc<dyn Handle>));
    }

    /// Register a property kind with a factory function.
    pub fn register_property<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> PersistenceResult<Arc<dyn ExecutionProperty>> + Send + Sync + 'static,
    {
        self.properties.write().insert(kind.to_string(), Arc::new(factory));
    }

    /// Produce an immutable snapshot for one restore.
    pub fn snapshot(&self) -> RuntimeRegistry {
        RuntimeRegistry {
            handles: Arc::new(self.handles.read().clone()),
            properties: Arc::new(self.properties.read().clone()),
        }
    }
}

/// Immutable view of the catalog.
#[derive(Clone)]
pub struct RuntimeRegistry {
    handles: Arc<HashMap<String, HandleFactory>>,
    properties: Arc<HashMap<String, PropertyFactory>>,
}

impl RuntimeRegistry {
    /// Rebuild a handle of the given type.
    pub fn create_handle(&self, type_name: &str, data: &Value) -> PersistenceResult<Arc<dyn Handle>> {
        let factory = self
            .handles
            .get(type_name)
            .ok_or_else(|| PersistenceError::UnknownHandleType(type_name.to_string()))?;
        factory(data)
    }

    /// Rebuild a property of the given kind.
    pub fn create_property(&self, kind: &str, state: &Value) -> PersistenceResult<Arc<dyn ExecutionProperty>> {
        let factory = self
            .properties
            .get(kind)
            .ok_or_else(|| PersistenceError::UnknownPropertyKind(kind.to_string()))?;
        factory(state)
    }

    /// Check whether the snapshot knows a handle type.
    pub fn has_handle_type(&self, type_name: &str) -> bool {
        self.handles.contains_key(type_name)
    }

    /// List all handle type names known to this snapshot.
    pub fn list_handle_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handles.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::HandleState;
    use crate::runtime::properties;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct AuditHandle {
        state: HandleState,
    }

    impl Handle for AuditHandle {
        fn state(&self) -> &HandleState {
            &self.state
        }

        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }
    }

    impl HandleType for AuditHandle {
        const TYPE_NAME: &'static str = "AuditHandle";

        fn create() -> Self {
            Self::default()
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = RuntimeCatalog::global().snapshot();
        assert!(registry.has_handle_type(NoPersistHandle::TYPE_NAME));
        assert!(registry.has_handle_type(RuntimeTransactionHandle::TYPE_NAME));
    }

    #[test]
    fn test_transaction_handle_keeps_its_id() {
        let registry = RuntimeCatalog::global().snapshot();
        let id = Uuid::new_v4();
        let handle = registry
            .create_handle(RuntimeTransactionHandle::TYPE_NAME, &json!({ "id": id }))
            .unwrap();
        let handle = crate::runtime::handle::downcast::<RuntimeTransactionHandle>(handle).unwrap();
        assert_eq!(handle.id(), id);

        let err = registry
            .create_handle(RuntimeTransactionHandle::TYPE_NAME, &json!({}))
            .err()
            .unwrap();
        assert!(matches!(err, PersistenceError::Corrupt(_)));
    }

    #[test]
    fn test_parallel_branch_property_restores() {
        let registry = RuntimeCatalog::global().snapshot();
        let property = registry.create_property(PARALLEL_BRANCH_KIND, &json!("a.b")).unwrap();
        let branch = properties::downcast::<ParallelBranchProperty>(property).unwrap();
        assert_eq!(branch.branch().id(), "a.b");
    }

    #[test]
    fn test_unknown_types_rejected() {
        let registry = RuntimeCatalog::global().snapshot();
        assert!(matches!(
            registry.create_handle("Nope", &Value::Null),
            Err(PersistenceError::UnknownHandleType(name)) if name == "Nope"
        ));
        assert!(matches!(
            registry.create_property("nope", &Value::Null),
            Err(PersistenceError::UnknownPropertyKind(_))
        ));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_registrations() {
        let before = RuntimeCatalog::global().snapshot();
        RuntimeCatalog::global().register_default_handle::<AuditHandle>();
        let after = RuntimeCatalog::global().snapshot();

        assert!(!before.has_handle_type(AuditHandle::TYPE_NAME));
        assert!(after.has_handle_type(AuditHandle::TYPE_NAME));
    }
}
