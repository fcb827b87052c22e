//! Integration tests for cancellation

use canopy::runtime::error::{ContractError, HostError, RuntimeError};
use canopy::runtime::instance::CompletedChild;
use canopy::runtime::storage::MemoryInstanceStore;
use canopy::runtime::tracking::{MemoryTrackingSink, TrackingKind};
use canopy::runtime::{
    Activity, ActivityBehavior, ActivityInstanceState, ActivityResult, BookmarkOptions, DispatcherMode, Executor,
    HostStatus, InstanceId, NativeActivityContext, RuntimeConfig, ScheduleOptions, WorkflowDefinition, WorkflowHost,
    WorkflowOutcome,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs every child and records the terminal state each one reports
struct Parallel {
    finished: Arc<Mutex<Vec<(String, ActivityInstanceState)>>>,
}

impl ActivityBehavior for Parallel {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        for index in 0..ctx.activity()?.children().len() {
            ctx.schedule_child(index, ScheduleOptions::on_complete("finished"))?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: &str,
        child: &CompletedChild,
    ) -> ActivityResult {
        self.finished.lock().push((child.display_name.clone(), child.state));
        Ok(())
    }
}

/// Waits forever; cancellation uses the default behavior
struct Idle;

impl ActivityBehavior for Idle {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        ctx.create_anonymous_bookmark("never", BookmarkOptions::NONE)?;
        Ok(())
    }
}

/// Ignores cancellation and keeps waiting
struct Stubborn;

impl ActivityBehavior for Stubborn {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        ctx.create_anonymous_bookmark("never", BookmarkOptions::NONE)?;
        Ok(())
    }

    fn cancel(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        assert!(ctx.is_cancellation_requested()?);
        ctx.track("cancel-ignored", serde_json::Value::Null)?;
        Ok(())
    }
}

fn definition(children: Vec<Activity>) -> (Arc<WorkflowDefinition>, Arc<Mutex<Vec<(String, ActivityInstanceState)>>>) {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut root = Activity::new(
        "parallel",
        Parallel {
            finished: Arc::clone(&finished),
        },
    );
    for child in children {
        root = root.with_child(child);
    }
    (WorkflowDefinition::new("cancellation", "1", root).unwrap(), finished)
}

#[test]
fn test_cancel_root_cancels_waiting_children() {
    let (definition, finished) = definition(vec![Activity::new("a", Idle), Activity::new("b", Idle)]);
    let mut executor = Executor::new(definition);
    executor.start(BTreeMap::new()).unwrap();
    executor.run_until_idle().unwrap();
    assert_eq!(executor.bookmarks().len(), 2);

    executor.cancel_root().unwrap();
    executor.run_until_idle().unwrap();

    let mut finished = finished.lock().clone();
    finished.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        finished,
        [
            ("a".to_string(), ActivityInstanceState::Canceled),
            ("b".to_string(), ActivityInstanceState::Canceled),
        ]
    );
    assert!(matches!(executor.outcome(), Some(WorkflowOutcome::Canceled)));
    assert!(executor.bookmarks().is_empty());
}

#[test]
fn test_ignored_cancellation_keeps_parent_waiting() {
    let (definition, finished) = definition(vec![Activity::new("a", Idle), Activity::new("stubborn", Stubborn)]);
    let sink = Arc::new(MemoryTrackingSink::new());
    let mut executor = Executor::new(definition).with_tracking_sink(sink.clone());
    executor.start(BTreeMap::new()).unwrap();
    executor.run_until_idle().unwrap();

    executor.cancel_root().unwrap();
    executor.run_until_idle().unwrap();

    assert_eq!(*finished.lock(), [("a".to_string(), ActivityInstanceState::Canceled)]);
    assert!(executor.outcome().is_none());
    assert_eq!(sink.custom_names(), ["cancel-ignored"]);

    // a second request is a no-op
    executor.cancel_root().unwrap();
    executor.run_until_idle().unwrap();
    assert_eq!(sink.custom_names(), ["cancel-ignored"]);
}

#[test]
fn test_only_children_can_be_canceled() {
    struct Meddler;

    impl ActivityBehavior for Meddler {
        fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
            let me = ctx.instance_id()?;
            let err = ctx.cancel_child(me).unwrap_err();
            assert_eq!(err, ContractError::NotAChild(me));
            Ok(())
        }
    }

    let definition = WorkflowDefinition::new("meddler", "1", Activity::new("meddler", Meddler)).unwrap();
    let mut executor = Executor::new(definition);
    executor.start(BTreeMap::new()).unwrap();
    executor.run_until_idle().unwrap();

    assert!(matches!(executor.outcome(), Some(WorkflowOutcome::Closed { .. })));
}

#[test]
fn test_host_cancel_reports_canceled_and_rejects_outputs() {
    let (definition, _finished) = definition(vec![Activity::new("a", Idle)]);
    let config = RuntimeConfig {
        dispatcher: DispatcherMode::Inline,
        ..RuntimeConfig::default()
    };
    let host = WorkflowHost::new(definition, Arc::new(MemoryInstanceStore::new()), config);
    host.run(BTreeMap::new()).unwrap();

    assert_eq!(host.cancel().unwrap(), HostStatus::Canceled);
    assert!(matches!(
        host.outputs(),
        Err(RuntimeError::Host(HostError::Aborted { instance, .. })) if instance == host.id()
    ));
    assert!(matches!(
        host.cancel(),
        Err(RuntimeError::Host(HostError::InstanceCompleted(_)))
    ));
}

#[test]
fn test_cancel_before_execution_skips_execute() {
    let (definition, finished) = definition(vec![Activity::new("a", Idle)]);
    let sink = Arc::new(MemoryTrackingSink::new());
    let mut executor = Executor::new(definition).with_tracking_sink(sink.clone());
    let root: InstanceId = executor.start(BTreeMap::new()).unwrap();

    executor.request_cancel(root).unwrap();
    executor.run_until_idle().unwrap();

    assert!(finished.lock().is_empty());
    assert!(matches!(executor.outcome(), Some(WorkflowOutcome::Canceled)));
    let resumed = sink
        .records()
        .iter()
        .any(|record| matches!(record.kind, TrackingKind::BookmarkResumed(_)));
    assert!(!resumed);
}
