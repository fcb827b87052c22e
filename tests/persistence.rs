//! Integration tests for persisting, unloading and reloading instances

use canopy::runtime::error::{HostError, PersistenceError, RuntimeError};
use canopy::runtime::storage::{FileInstanceStore, InstanceStore};
use canopy::runtime::transaction::{CommittableTransaction, IsolationLevel, RuntimeTransactionHandle};
use canopy::runtime::{
    Activity, ActivityBehavior, ActivityResult, Argument, Bookmark, BookmarkOptions, BookmarkResumptionResult,
    DispatcherMode, HostStatus, NativeActivityContext, RuntimeConfig, ScheduleOptions, TransactionContext, Variable,
    WorkflowDefinition, WorkflowHost, WorkflowInstanceId,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

type Seen = Arc<Mutex<Vec<Uuid>>>;

/// Sums payloads delivered to "add"; "close" commits the total inside a
/// runtime transaction
struct Ledger {
    count: Variable<i64>,
    total: Argument<i64>,
}

impl ActivityBehavior for Ledger {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        ctx.get_or_create_handle::<RuntimeTransactionHandle>()?;
        ctx.create_bookmark("add", "add", BookmarkOptions::MULTIPLE_RESUME)?;
        ctx.create_bookmark("close", "close", BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut NativeActivityContext<'_>,
        _bookmark: &Bookmark,
        callback: &str,
        payload: Value,
    ) -> ActivityResult {
        match callback {
            "add" => {
                let delta = payload.as_i64().unwrap_or(0);
                let count = ctx.get(&self.count)?;
                ctx.set(&self.count, count + delta)?;
            }
            "close" => {
                let handle = ctx
                    .find_handle::<RuntimeTransactionHandle>()?
                    .ok_or_else(|| anyhow::anyhow!("transaction handle missing"))?;
                ctx.request_transaction_context(&handle, "commit")?;
            }
            other => anyhow::bail!("unexpected callback {other}"),
        }
        Ok(())
    }

    fn on_transaction_context(&self, ctx: &mut TransactionContext<'_, '_>, _callback: &str) -> ActivityResult {
        ctx.set_runtime_transaction(Arc::new(CommittableTransaction::new(IsolationLevel::Snapshot)))?;
        ctx.remove_all_bookmarks()?;
        let count = ctx.get(&self.count)?;
        ctx.set(&self.total, count)?;
        ctx.schedule_child(0, ScheduleOptions::default())?;
        Ok(())
    }
}

struct Witness {
    seen: Seen,
}

impl ActivityBehavior for Witness {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        if let Some(transaction) = ctx.ambient_transaction()? {
            self.seen.lock().push(transaction.id());
        }
        Ok(())
    }
}

fn definition(version: &str, seen: &Seen) -> Arc<WorkflowDefinition> {
    let count = Variable::<i64>::new("count").mapped().with_default(0);
    let total = Argument::<i64>::output("total");
    let root = Activity::new(
        "ledger",
        Ledger {
            count: count.clone(),
            total: total.clone(),
        },
    )
    .with_variable(&count)
    .with_argument(&total)
    .with_child(Activity::new(
        "witness",
        Witness {
            seen: Arc::clone(seen),
        },
    ));
    WorkflowDefinition::new("ledger", version, root).unwrap()
}

fn config(root: &TempDir) -> RuntimeConfig {
    RuntimeConfig {
        root: root.path().to_path_buf(),
        dispatcher: DispatcherMode::Inline,
        ..RuntimeConfig::default()
    }
}

fn bookmark(name: &str) -> Bookmark {
    Bookmark::named(name).unwrap()
}

/// Runs a fresh ledger, adds 5 and unloads it
fn unloaded(dir: &TempDir, store: &Arc<FileInstanceStore>, seen: &Seen) -> WorkflowInstanceId {
    let host = WorkflowHost::new(definition("1", seen), store.clone(), config(dir));
    host.run(BTreeMap::new()).unwrap();
    host.resume_bookmark(&bookmark("add"), json!(5)).unwrap();
    host.unload().unwrap()
}

#[test]
fn test_instance_survives_unload_and_reload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileInstanceStore::open(dir.path()).unwrap());
    let seen = Seen::default();

    let id = unloaded(&dir, &store, &seen);
    assert_eq!(store.list().unwrap(), [id]);

    let host = WorkflowHost::load(id, definition("1", &seen), store.clone(), config(&dir)).unwrap();
    assert_eq!(host.id(), id);
    assert!(matches!(
        host.status().unwrap(),
        HostStatus::Idle {
            blocking: 2,
            can_persist: true,
            ..
        }
    ));
    assert_eq!(host.mapped_variables().unwrap()["ledger/count"], json!(5));

    host.resume_bookmark(&bookmark("add"), json!(7)).unwrap();
    let closed = host.resume_bookmark(&bookmark("close"), Value::Null).unwrap();
    assert_eq!(closed, BookmarkResumptionResult::Success);

    assert_eq!(host.status().unwrap(), HostStatus::Closed);
    let outputs = host.outputs().unwrap().expect("root closed");
    assert_eq!(outputs["total"], json!(12));
    // the restored handle re-registered the ambient transaction property
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_reload_with_changed_definition_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileInstanceStore::open(dir.path()).unwrap());
    let seen = Seen::default();
    let id = unloaded(&dir, &store, &seen);

    let err = WorkflowHost::load(id, definition("2", &seen), store.clone(), config(&dir)).unwrap_err();
    match err {
        RuntimeError::Host(HostError::VersionMismatch {
            instance,
            expected,
            actual,
        }) => {
            assert_eq!(instance, id);
            assert_eq!(expected.version, "1");
            assert_eq!(actual.version, "2");
            assert_eq!(expected.fingerprint, actual.fingerprint);
        }
        other => panic!("expected a version mismatch, got {other:?}"),
    }
}

#[test]
fn test_loading_unknown_instance_fails() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileInstanceStore::open(dir.path()).unwrap());
    let missing = WorkflowInstanceId::new();

    let err = WorkflowHost::load(missing, definition("1", &Seen::default()), store, config(&dir)).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Persistence(PersistenceError::NotFound(id)) if id == missing
    ));
}

#[test]
fn test_unload_refused_while_work_is_queued() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileInstanceStore::open(dir.path()).unwrap());
    let host = WorkflowHost::new(definition("1", &Seen::default()), store, config(&dir));
    host.run(BTreeMap::new()).unwrap();

    host.with_executor(|executor| executor.resume_bookmark(&bookmark("add"), json!(1)))
        .unwrap()
        .unwrap();

    assert!(matches!(
        host.unload(),
        Err(RuntimeError::Persistence(PersistenceError::Busy(1)))
    ));
}

#[test]
fn test_config_round_trips_through_storage_root() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.persist_on_idle = false;
    config.init().unwrap();

    let loaded = RuntimeConfig::load(dir.path()).unwrap();
    assert!(!loaded.persist_on_idle);
    assert_eq!(loaded.dispatcher, DispatcherMode::Inline);
    assert_eq!(loaded.timeouts, config.timeouts);
}
