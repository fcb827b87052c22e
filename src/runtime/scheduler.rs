//! Work-item scheduler
//!
//! Work items are stamped with a logical clock on enqueue and handed out
//! in clock order, which makes execution order a pure function of the
//! enqueue order and lets a persisted queue replay identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use uuid::Uuid;

use super::bookmark::Bookmark;
use super::instance::{CompletedChild, InstanceId};

/// Logical clock value for work ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalClock(pub u64);

impl LogicalClock {
    /// Clock at zero
    pub fn zero() -> Self {
        Self(0)
    }

    /// Next clock value
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// A unit of work for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Run the activity's `execute`
    Execute {
        /// Target instance
        instance: InstanceId,
    },
    /// Run the activity's `cancel`
    Cancel {
        /// Target instance
        instance: InstanceId,
    },
    /// Notify a parent that a child finished
    ChildCompleted {
        /// Parent instance
        parent: InstanceId,
        /// Completion callback registered at scheduling time
        callback: Option<String>,
        /// The finished child
        child: CompletedChild,
    },
    /// Deliver a bookmark payload to its owner
    ResumeBookmark {
        /// Owning instance
        owner: InstanceId,
        /// Resumed bookmark
        bookmark: Bookmark,
        /// Callback registered with the bookmark
        callback: Option<String>,
        /// Host payload
        payload: Value,
    },
    /// Open a transaction context for a runtime transaction handle
    TransactionContext {
        /// Handle owner
        owner: InstanceId,
        /// Handle identity
        handle_id: Uuid,
        /// Callback on the owning activity
        callback: String,
    },
}

impl WorkItem {
    /// Instance the item runs against
    pub fn target(&self) -> InstanceId {
        match self {
            WorkItem::Execute { instance } | WorkItem::Cancel { instance } => *instance,
            WorkItem::ChildCompleted { parent, .. } => *parent,
            WorkItem::ResumeBookmark { owner, .. } | WorkItem::TransactionContext { owner, .. } => *owner,
        }
    }

    /// Whether the item delivers a callback the target must stay alive for
    pub fn awaits_target(&self) -> bool {
        matches!(
            self,
            WorkItem::ChildCompleted { .. } | WorkItem::ResumeBookmark { .. } | WorkItem::TransactionContext { .. }
        )
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            WorkItem::Execute { .. } => "execute",
            WorkItem::Cancel { .. } => "cancel",
            WorkItem::ChildCompleted { .. } => "child-completed",
            WorkItem::ResumeBookmark { .. } => "resume-bookmark",
            WorkItem::TransactionContext { .. } => "transaction-context",
        }
    }
}

/// Work item stamped for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledWork {
    /// Logical clock
    pub clock: LogicalClock,
    /// Work to do
    pub item: WorkItem,
}

impl PartialEq for ScheduledWork {
    fn eq(&self, other: &Self) -> bool {
        self.clock == other.clock
    }
}

impl Eq for ScheduledWork {}

impl PartialOrd for ScheduledWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledWork {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest clock first)
        other.clock.cmp(&self.clock)
    }
}

/// Persisted queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Pending work in clock order
    pub pending: Vec<ScheduledWork>,
    /// Last stamped clock
    pub clock: LogicalClock,
}

/// FIFO work scheduler
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Ready queue (min-heap by logical clock)
    ready_queue: BinaryHeap<ScheduledWork>,

    /// Last stamped clock
    clock: LogicalClock,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a work item
    pub fn enqueue(&mut self, item: WorkItem) -> LogicalClock {
        let clock = self.clock.next();
        tracing::trace!(clock = clock.0, work = item.label(), target = %item.target(), "work enqueued");
        self.ready_queue.push(ScheduledWork { clock, item });
        self.clock = clock;
        clock
    }

    /// Next item in clock order
    pub fn next_item(&mut self) -> Option<ScheduledWork> {
        self.ready_queue.pop()
    }

    /// Check if any work is ready
    pub fn has_ready_work(&self) -> bool {
        !self.ready_queue.is_empty()
    }

    /// Get the number of pending items
    pub fn pending_count(&self) -> usize {
        self.ready_queue.len()
    }

    /// Whether a queued callback still targets `instance`
    pub fn has_pending_callback(&self, instance: InstanceId) -> bool {
        self.ready_queue
            .iter()
            .any(|work| work.item.awaits_target() && work.item.target() == instance)
    }

    /// Persisted form
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let mut pending: Vec<_> = self.ready_queue.iter().cloned().collect();
        pending.sort_by_key(|work| work.clock);
        SchedulerSnapshot {
            pending,
            clock: self.clock,
        }
    }

    /// Rebuild from the persisted form
    pub fn restore(snapshot: SchedulerSnapshot) -> Self {
        Self {
            ready_queue: snapshot.pending.into_iter().collect(),
            clock: snapshot.clock,
        }
    }
}
