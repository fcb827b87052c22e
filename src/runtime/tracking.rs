//! Tracking records and sinks
//!
//! The executor emits a record for every instance state change, every
//! bookmark resumption and every fault. Activity code may add custom
//! records through its context.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bookmark::Bookmark;
use super::instance::{ActivityInstanceState, InstanceId};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingKind {
    /// Instance entered a state
    StateChanged(ActivityInstanceState),
    /// A bookmark callback was delivered
    BookmarkResumed(Bookmark),
    /// A fault was raised or propagated
    Fault(String),
    /// Emitted by activity code
    Custom {
        /// Record name
        name: String,
        /// Payload
        data: Value,
    },
}

/// One tracking record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Wall-clock time
    pub timestamp: DateTime<Utc>,
    /// Instance the record is about
    pub instance: InstanceId,
    /// Display name of its activity
    pub activity: String,
    /// Payload
    pub kind: TrackingKind,
}

impl TrackingRecord {
    /// Timestamped record
    pub fn new(instance: InstanceId, activity: impl Into<String>, kind: TrackingKind) -> Self {
        Self {
            timestamp: Utc::now(),
            instance,
            activity: activity.into(),
            kind,
        }
    }
}

/// Consumer of tracking records
pub trait TrackingSink: Send + Sync {
    /// Accept a record
    fn record(&self, record: &TrackingRecord);
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct MemoryTrackingSink {
    records: Mutex<Vec<TrackingRecord>>,
}

impl MemoryTrackingSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records.lock().clone()
    }

    /// Custom record names in order
    pub fn custom_names(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match &record.kind {
                TrackingKind::Custom { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TrackingSink for MemoryTrackingSink {
    fn record(&self, record: &TrackingRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Forwards records to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTrackingSink;

impl TrackingSink for TracingTrackingSink {
    fn record(&self, record: &TrackingRecord) {
        match &record.kind {
            TrackingKind::StateChanged(state) => {
                tracing::info!(instance = %record.instance, activity = %record.activity, ?state, "activity state changed")
            }
            TrackingKind::BookmarkResumed(bookmark) => {
                tracing::info!(instance = %record.instance, activity = %record.activity, %bookmark, "bookmark resumed")
            }
            TrackingKind::Fault(message) => {
                tracing::warn!(instance = %record.instance, activity = %record.activity, %message, "activity faulted")
            }
            TrackingKind::Custom { name, data } => {
                tracing::info!(instance = %record.instance, activity = %record.activity, %name, %data, "custom tracking record")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = MemoryTrackingSink::new();
        let id = InstanceId {
            index: 0,
            generation: 0,
        };
        sink.record(&TrackingRecord::new(
            id,
            "root",
            TrackingKind::StateChanged(ActivityInstanceState::Executing),
        ));
        sink.record(&TrackingRecord::new(
            id,
            "root",
            TrackingKind::Custom {
                name: "progress".into(),
                data: json!(50),
            },
        ));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(sink.custom_names(), ["progress"]);
        assert!(records[0].timestamp <= records[1].timestamp);
    }
}
