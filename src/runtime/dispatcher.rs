//! Dispatch of host work onto an execution context
//!
//! `post` queues a job and returns immediately; `send` runs it before
//! returning. The process-wide [`DefaultDispatcher`] drains its queue on a
//! dedicated thread one job at a time, so jobs posted through it never
//! interleave.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// Unit of dispatched work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context for host operations
pub trait Dispatcher: Send + Sync + fmt::Debug {
    /// Queue `job`; the caller does not wait
    fn post(&self, job: Job);

    /// Run `job` before returning
    fn send(&self, job: Job) {
        job()
    }

    /// Whether this is the process-wide default
    fn is_default(&self) -> bool {
        false
    }

    /// Independent copy for a new scope
    fn create_copy(&self) -> Arc<dyn Dispatcher>;
}

/// Dispatcher for a nested scope: the default is shared, others are copied
pub fn clone_for_scope(dispatcher: &Arc<dyn Dispatcher>) -> Arc<dyn Dispatcher> {
    if dispatcher.is_default() {
        Arc::clone(dispatcher)
    } else {
        dispatcher.create_copy()
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("dispatched job panicked");
    }
}

/// Process-wide serial work queue
pub struct DefaultDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

static DEFAULT_DISPATCHER: OnceLock<Arc<DefaultDispatcher>> = OnceLock::new();

impl DefaultDispatcher {
    /// The shared instance, started on first use
    pub fn global() -> Arc<DefaultDispatcher> {
        Arc::clone(DEFAULT_DISPATCHER.get_or_init(|| Arc::new(Self::start())))
    }

    fn start() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let spawned = std::thread::Builder::new()
            .name("canopy-dispatcher".into())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    run_job(job);
                }
                tracing::debug!("default dispatcher drained");
            });
        let sender = match spawned {
            Ok(_) => Some(sender),
            Err(err) => {
                tracing::error!(error = %err, "failed to start dispatcher thread; posting inline");
                None
            }
        };
        Self {
            sender: Mutex::new(sender),
        }
    }

    /// Stop accepting work; queued jobs still run
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::info!("default dispatcher shut down");
        }
    }

    /// Whether jobs are still queued to the worker thread
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl Dispatcher for DefaultDispatcher {
    fn post(&self, job: Job) {
        let rejected = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).err().map(|err| err.0),
            None => Some(job),
        };
        if let Some(job) = rejected {
            tracing::warn!("default dispatcher unavailable; running job inline");
            run_job(job);
        }
    }

    fn is_default(&self) -> bool {
        true
    }

    fn create_copy(&self) -> Arc<dyn Dispatcher> {
        Self::global()
    }
}

impl fmt::Debug for DefaultDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultDispatcher")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Runs every job on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        run_job(job);
    }

    fn create_copy(&self) -> Arc<dyn Dispatcher> {
        Arc::new(InlineDispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_default_dispatcher_runs_in_post_order() {
        let dispatcher = DefaultDispatcher::global();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            dispatcher.post(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_clone_for_scope_preserves_default_identity() {
        let default: Arc<dyn Dispatcher> = DefaultDispatcher::global();
        let scoped = clone_for_scope(&default);
        assert!(Arc::ptr_eq(&default, &scoped));

        let inline: Arc<dyn Dispatcher> = Arc::new(InlineDispatcher);
        let copy = clone_for_scope(&inline);
        assert!(!Arc::ptr_eq(&inline, &copy));
        assert!(!copy.is_default());
    }

    #[test]
    fn test_send_runs_before_returning() {
        let dispatcher = InlineDispatcher;
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        dispatcher.send(Box::new(move || *flag.lock() = true));
        assert!(*hit.lock());
    }

    #[test]
    fn test_panicking_job_does_not_stop_worker() {
        let dispatcher = DefaultDispatcher::global();
        dispatcher.post(Box::new(|| panic!("boom")));
        let (tx, rx) = std_mpsc::channel();
        dispatcher.post(Box::new(move || {
            let _ = tx.send(());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
