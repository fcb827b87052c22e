//! Host extensions available to activity code, keyed by type

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{ContractError, ContractResult};

/// Typed extension registry
#[derive(Default)]
pub struct WorkflowExtensions {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl WorkflowExtensions {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension; a second one of the same type fails
    pub fn add<T: Any + Send + Sync>(&mut self, extension: T) -> ContractResult<Arc<T>> {
        self.add_shared(Arc::new(extension))
    }

    /// Register a shared extension
    pub fn add_shared<T: Any + Send + Sync>(&mut self, extension: Arc<T>) -> ContractResult<Arc<T>> {
        let key = TypeId::of::<T>();
        if self.entries.contains_key(&key) {
            return Err(ContractError::DuplicateExtension(type_name::<T>()));
        }
        self.entries.insert(key, Arc::clone(&extension) as Arc<dyn Any + Send + Sync>);
        Ok(extension)
    }

    /// Registered extension of type `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry).downcast::<T>().ok())
    }

    /// Existing extension, or one built by `factory` and registered
    pub fn get_or_add<T, F>(&mut self, factory: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        let extension = Arc::new(factory());
        self.entries
            .insert(TypeId::of::<T>(), Arc::clone(&extension) as Arc<dyn Any + Send + Sync>);
        extension
    }

    /// Number of registered extensions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No extensions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Clock(u64);

    #[test]
    fn test_duplicate_add_fails() {
        let mut extensions = WorkflowExtensions::new();
        extensions.add(Clock(1)).unwrap();
        let err = extensions.add(Clock(2)).unwrap_err();
        assert!(matches!(err, ContractError::DuplicateExtension(name) if name.ends_with("Clock")));
        assert_eq!(extensions.get::<Clock>().unwrap().0, 1);
    }

    #[test]
    fn test_get_or_add_invokes_factory_once() {
        let calls = AtomicUsize::new(0);
        let mut extensions = WorkflowExtensions::new();
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Clock(7)
        };

        let first = extensions.get_or_add(factory);
        let second = extensions.get_or_add(factory);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(extensions.len(), 1);
    }

    #[test]
    fn test_missing_extension() {
        let extensions = WorkflowExtensions::new();
        assert!(extensions.get::<Clock>().is_none());
        assert!(extensions.is_empty());
    }
}
