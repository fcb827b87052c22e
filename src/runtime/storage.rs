//! Filesystem layout helpers, atomic writes and instance stores
//!
//! Manages the .canopy/ directory structure, ensures atomic writes via
//! temp files and renames, and provides the stores persisted workflow
//! instances are saved to and loaded from.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use super::error::{PersistenceError, PersistenceResult, StorageError, StorageResult};
use super::host::WorkflowInstanceId;
use super::snapshot::WorkflowSnapshot;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the instances directory path
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Get the snapshot path of one workflow instance
    pub fn instance_path(&self, id: WorkflowInstanceId) -> PathBuf {
        self.instances_dir().join(format!("{id}.json"))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let temp_path = path.with_extension("tmp");
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };

        let mut file = File::create(&temp_path).map_err(|err| failed(format!("create {temp_path:?}: {err}")))?;
        file.write_all(data).map_err(|err| failed(format!("write: {err}")))?;
        file.sync_all().map_err(|err| failed(format!("sync: {err}")))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|err| failed(format!("rename {temp_path:?}: {err}")))?;

        // Sync parent directory
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .map_err(|err| failed(format!("open directory {parent:?}: {err}")))?;
            dir.sync_all().map_err(|err| failed(format!("sync directory: {err}")))?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        if !path.exists() {
            return Err(StorageError::PathNotFound(path.to_path_buf()));
        }
        Ok(fs::read(path)?)
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        Ok(fs::create_dir_all(path)?)
    }

    /// List files in a directory
    pub fn list_dir(&self, path: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }
}

/// Initialize storage directories for a new runtime
pub fn init_storage(root: &Path) -> StorageResult<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.instances_dir())?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> StorageResult<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config)?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> StorageResult<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    Ok(serde_json::from_slice(&data)?)
}

/// Durable home of persisted workflow instances
pub trait InstanceStore: Send + Sync {
    /// Save or replace a snapshot
    fn save(&self, snapshot: &WorkflowSnapshot) -> PersistenceResult<()>;

    /// Load a snapshot
    fn load(&self, id: WorkflowInstanceId) -> PersistenceResult<WorkflowSnapshot>;

    /// Delete a snapshot; false if absent
    fn delete(&self, id: WorkflowInstanceId) -> PersistenceResult<bool>;

    /// Ids of stored instances
    fn list(&self) -> PersistenceResult<Vec<WorkflowInstanceId>>;
}

/// One JSON file per instance under `<root>/instances`
#[derive(Debug, Clone)]
pub struct FileInstanceStore {
    storage: Storage,
}

impl FileInstanceStore {
    /// Store rooted at `root`, creating the layout if needed
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        init_storage(&root)?;
        Ok(Self {
            storage: Storage::new(root),
        })
    }

    /// Underlying storage layout
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl InstanceStore for FileInstanceStore {
    fn save(&self, snapshot: &WorkflowSnapshot) -> PersistenceResult<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(StorageError::from)?;
        let path = self.storage.instance_path(snapshot.workflow_id);
        self.storage.write_atomic(&path, &json)?;
        tracing::debug!(workflow = %snapshot.workflow_id, path = %path.display(), "instance saved");
        Ok(())
    }

    fn load(&self, id: WorkflowInstanceId) -> PersistenceResult<WorkflowSnapshot> {
        let data = match self.storage.read_file(&self.storage.instance_path(id)) {
            Ok(data) => data,
            Err(StorageError::PathNotFound(_)) => return Err(PersistenceError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data).map_err(StorageError::from)?)
    }

    fn delete(&self, id: WorkflowInstanceId) -> PersistenceResult<bool> {
        let path = self.storage.instance_path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(StorageError::from)?;
        Ok(true)
    }

    fn list(&self) -> PersistenceResult<Vec<WorkflowInstanceId>> {
        let ids: Vec<WorkflowInstanceId> = self
            .storage
            .list_dir(&self.storage.instances_dir())?
            .into_iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem()?.to_str()?.parse().ok())
            .collect();
        Ok(ids)
    }
}

/// In-process store keeping serialized snapshots
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    entries: Mutex<HashMap<WorkflowInstanceId, String>>,
}

impl MemoryInstanceStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn save(&self, snapshot: &WorkflowSnapshot) -> PersistenceResult<()> {
        let json = serde_json::to_string(snapshot).map_err(StorageError::from)?;
        self.entries.lock().insert(snapshot.workflow_id, json);
        Ok(())
    }

    fn load(&self, id: WorkflowInstanceId) -> PersistenceResult<WorkflowSnapshot> {
        let entries = self.entries.lock();
        let json = entries.get(&id).ok_or(PersistenceError::NotFound(id))?;
        Ok(serde_json::from_str(json).map_err(StorageError::from)?)
    }

    fn delete(&self, id: WorkflowInstanceId) -> PersistenceResult<bool> {
        Ok(self.entries.lock().remove(&id).is_some())
    }

    fn list(&self) -> PersistenceResult<Vec<WorkflowInstanceId>> {
        let mut ids: Vec<_> = self.entries.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{Activity, WorkflowDefinition};
    use crate::runtime::executor::Executor;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn snapshot() -> WorkflowSnapshot {
        let def = WorkflowDefinition::new("store", "1", Activity::code("root", |_ctx| Ok(()))).unwrap();
        let mut executor = Executor::new(def);
        executor.start(BTreeMap::new()).unwrap();
        WorkflowSnapshot::capture(&executor, WorkflowInstanceId::new()).unwrap()
    }

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        init_storage(root).unwrap();

        assert!(root.join("instances").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            persist_on_idle: false,
            debug: true,
            ..RuntimeConfig::default()
        };

        write_config(&config).unwrap();
        let loaded = load_config(&root).unwrap();

        assert!(!loaded.persist_on_idle);
        assert!(loaded.debug);
        assert_eq!(loaded.timeouts, config.timeouts);
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        let data = b"Hello, world!";
        storage.write_atomic(&test_file, data).unwrap();

        let read_data = storage.read_file(&test_file).unwrap();
        assert_eq!(data, &read_data[..]);
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn test_file_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileInstanceStore::open(temp.path()).unwrap();
        let snapshot = snapshot();
        let id = snapshot.workflow_id;

        store.save(&snapshot).unwrap();
        assert_eq!(store.list().unwrap(), [id]);
        let loaded = store.load(id).unwrap();
        assert_eq!(loaded.identity, snapshot.identity);
        assert_eq!(loaded.scheduler.pending.len(), 1);

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(matches!(store.load(id), Err(PersistenceError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn test_memory_store_not_found() {
        let store = MemoryInstanceStore::new();
        let snapshot = snapshot();
        store.save(&snapshot).unwrap();
        assert!(store.load(snapshot.workflow_id).is_ok());
        assert!(matches!(
            store.load(WorkflowInstanceId::new()),
            Err(PersistenceError::NotFound(_))
        ));
    }
}
