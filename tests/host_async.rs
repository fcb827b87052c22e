//! Async host API over the default dispatcher

use canopy::runtime::dispatcher::{DefaultDispatcher, Dispatcher};
use canopy::runtime::error::{HostError, RuntimeError};
use canopy::runtime::storage::MemoryInstanceStore;
use canopy::runtime::{
    Activity, ActivityBehavior, ActivityResult, Bookmark, BookmarkOptions, BookmarkResumptionResult,
    NativeActivityContext, RuntimeConfig, WorkflowDefinition, WorkflowHost,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

struct Counter {
    total: Arc<AtomicU64>,
}

impl ActivityBehavior for Counter {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark("tick", "tick", BookmarkOptions::MULTIPLE_RESUME)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _bookmark: &Bookmark,
        _callback: &str,
        payload: Value,
    ) -> ActivityResult {
        self.total.fetch_add(payload.as_u64().unwrap_or(0), Ordering::SeqCst);
        Ok(())
    }
}

fn host(config: RuntimeConfig) -> (WorkflowHost, Arc<AtomicU64>) {
    let total = Arc::new(AtomicU64::new(0));
    let root = Activity::new(
        "counter",
        Counter {
            total: Arc::clone(&total),
        },
    );
    let definition = WorkflowDefinition::new("counter", "1", root).unwrap();
    let host = WorkflowHost::new(definition, Arc::new(MemoryInstanceStore::new()), config);
    host.run(BTreeMap::new()).unwrap();
    (host, total)
}

fn tick() -> Bookmark {
    Bookmark::named("tick").unwrap()
}

#[tokio::test]
async fn test_concurrent_resumptions_are_serialized() {
    let (host, total) = host(RuntimeConfig::default());

    let mut tasks = JoinSet::new();
    for amount in 1..=5u64 {
        let host = host.clone();
        tasks.spawn(async move { host.resume_bookmark_async(tick(), json!(amount)).await });
    }
    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.unwrap().unwrap(), BookmarkResumptionResult::Success);
    }

    assert_eq!(total.load(Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_unknown_bookmark_reports_not_found() {
    let (host, _total) = host(RuntimeConfig::default());
    let result = host
        .resume_bookmark_async(Bookmark::named("missing").unwrap(), Value::Null)
        .await
        .unwrap();
    assert_eq!(result, BookmarkResumptionResult::NotFound);
}

#[tokio::test]
async fn test_resumption_times_out_behind_a_busy_queue() {
    let mut config = RuntimeConfig::default();
    config.timeouts.resume_bookmark = Duration::from_millis(50);
    let (host, _total) = host(config);

    DefaultDispatcher::global().post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));

    let err = host.resume_bookmark_async(tick(), json!(1)).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Host(HostError::Timeout {
            operation: "resume_bookmark",
            ..
        })
    ));
}
