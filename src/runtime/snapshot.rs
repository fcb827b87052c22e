//! Persisted shape of a workflow instance
//!
//! A [`WorkflowSnapshot`] captures everything needed to rebuild an
//! executor at an idle point: the arena slots with their generations, each
//! live instance's locations, handles and persistable properties, the
//! bookmark table and the pending work queue. Capture is refused while
//! persistence is blocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::activity::{DefinitionId, WorkflowDefinition, WorkflowIdentity};
use super::bookmark::{BookmarkManager, BookmarkSnapshot};
use super::error::{PersistenceError, PersistenceResult};
use super::executor::{Executor, WorkflowOutcome};
use super::handle::{HandleBinding, HandleContext};
use super::host::WorkflowInstanceId;
use super::instance::{ActivityInstanceState, InstanceId, InstanceTree, RestoredInstance, SlotParts};
use super::location::Environment;
use super::registry::RuntimeRegistry;
use super::scheduler::{Scheduler, SchedulerSnapshot};

/// Current snapshot layout version
pub const FORMAT_VERSION: u32 = 1;

/// Persisted handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSnapshot {
    /// Key in the owner's handle map
    pub key: String,
    /// Catalog type name
    pub type_name: String,
    /// Owner and initialization flag
    pub binding: HandleBinding,
    /// Type-specific data
    pub data: Value,
}

/// Persisted execution property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySnapshot {
    /// Registered name
    pub name: String,
    /// Catalog kind
    pub kind: String,
    /// Visibility to descendants
    pub visible_to_children: bool,
    /// Kind-specific state
    pub state: Value,
}

/// Persisted activity instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Activity within the definition
    pub activity: DefinitionId,
    /// Lifecycle state
    pub state: ActivityInstanceState,
    /// Parent instance
    pub parent: Option<InstanceId>,
    /// Children in scheduling order
    pub children: Vec<InstanceId>,
    /// Location values in declaration order
    pub environment: Vec<Value>,
    /// Handles owned by the instance
    pub handles: Vec<HandleSnapshot>,
    /// Persistable properties in registration order
    pub properties: Vec<PropertySnapshot>,
    /// Completion callback on the parent
    pub completion: Option<String>,
    /// Fault callback on the parent
    pub fault_callback: Option<String>,
    /// Cancellation requested
    pub cancel_requested: bool,
    /// Marked canceled by its activity
    pub marked_canceled: bool,
}

/// Persisted arena slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSnapshot {
    /// Slot generation
    pub generation: u32,
    /// Live instance, if any
    pub instance: Option<InstanceSnapshot>,
}

/// Complete persisted workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Layout version
    pub format_version: u32,
    /// Host-assigned instance id
    pub workflow_id: WorkflowInstanceId,
    /// Definition the instance was created from
    pub identity: WorkflowIdentity,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Arena slots
    pub slots: Vec<SlotSnapshot>,
    /// Root instance
    pub root: Option<InstanceId>,
    /// Bookmark table
    pub bookmarks: BookmarkSnapshot,
    /// Pending work
    pub scheduler: SchedulerSnapshot,
    /// Activation counter
    pub activations: u64,
    /// Outstanding persist request
    pub persist_requested: bool,
    /// Final outcome, if the root finished
    pub outcome: Option<WorkflowOutcome>,
}

impl WorkflowSnapshot {
    /// Capture `executor`; fails while persistence is blocked
    pub fn capture(executor: &Executor, workflow_id: WorkflowInstanceId) -> PersistenceResult<Self> {
        executor.blockers().check()?;

        let slots = executor
            .tree()
            .slot_generations()
            .map(|(generation, instance)| SlotSnapshot {
                generation,
                instance: instance.map(|instance| InstanceSnapshot {
                    activity: instance.activity().id().unwrap_or_default(),
                    state: instance.state(),
                    parent: instance.parent(),
                    children: instance.children().to_vec(),
                    environment: instance.environment().values().to_vec(),
                    handles: instance
                        .handles
                        .iter()
                        .map(|(key, handle)| HandleSnapshot {
                            key: key.clone(),
                            type_name: handle.type_name().to_string(),
                            binding: handle.state().binding(),
                            data: handle.persisted_data(),
                        })
                        .collect(),
                    properties: instance
                        .properties
                        .entries()
                        .iter()
                        .filter_map(|entry| {
                            let (kind, state) = entry.value().persisted_state()?;
                            Some(PropertySnapshot {
                                name: entry.name().to_string(),
                                kind: kind.to_string(),
                                visible_to_children: entry.visible_to_children(),
                                state,
                            })
                        })
                        .collect(),
                    completion: instance.completion.clone(),
                    fault_callback: instance.fault_callback.clone(),
                    cancel_requested: instance.cancel_requested,
                    marked_canceled: instance.marked_canceled,
                }),
            })
            .collect();

        Ok(Self {
            format_version: FORMAT_VERSION,
            workflow_id,
            identity: executor.definition().identity().clone(),
            created_at: Utc::now(),
            slots,
            root: executor.tree().root(),
            bookmarks: executor.bookmarks().snapshot(),
            scheduler: executor.scheduler.snapshot(),
            activations: executor.activations,
            persist_requested: executor.persist_requested(),
            outcome: executor.outcome().cloned(),
        })
    }

    /// Number of live instances
    pub fn instance_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.instance.is_some()).count()
    }

    /// Rebuild an executor for `definition`.
    ///
    /// The caller checks the identity; this only verifies that every
    /// referenced activity exists and every handle and property type is
    /// known to `registry`.
    pub fn restore(self, definition: Arc<WorkflowDefinition>, registry: &RuntimeRegistry) -> PersistenceResult<Executor> {
        if self.format_version != FORMAT_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "unsupported snapshot format {}",
                self.format_version
            )));
        }

        let mut pending = Vec::new();
        let mut parts = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            let instance = match slot.instance {
                Some(snapshot) => {
                    let activity = definition.activity(snapshot.activity).cloned().ok_or_else(|| {
                        PersistenceError::Corrupt(format!("unknown activity {}", snapshot.activity))
                    })?;
                    let id = InstanceId {
                        index: index as u32,
                        generation: slot.generation,
                    };
                    pending.push((id, snapshot.handles, snapshot.properties));
                    Some(RestoredInstance {
                        activity,
                        state: snapshot.state,
                        parent: snapshot.parent,
                        children: snapshot.children,
                        environment: Environment::from_values(snapshot.environment),
                        completion: snapshot.completion,
                        fault_callback: snapshot.fault_callback,
                        cancel_requested: snapshot.cancel_requested,
                        marked_canceled: snapshot.marked_canceled,
                    })
                }
                None => None,
            };
            parts.push(SlotParts {
                generation: slot.generation,
                instance,
            });
        }

        let mut executor = Executor::new(definition);
        executor.tree = InstanceTree::from_parts(parts, self.root);
        executor.bookmarks = BookmarkManager::restore(self.bookmarks);
        executor.scheduler = Scheduler::restore(self.scheduler);
        executor.activations = self.activations;
        executor.persist_requested = self.persist_requested;
        executor.outcome = self.outcome;

        let mut restored = Vec::new();
        for (id, handles, properties) in pending {
            let node = executor
                .tree
                .get_mut(id)
                .map_err(|err| PersistenceError::Corrupt(err.to_string()))?;
            for property in properties {
                let value = registry.create_property(&property.kind, &property.state)?;
                node.properties
                    .push(property.name, value, property.visible_to_children);
            }
            for handle in handles {
                let value = registry.create_handle(&handle.type_name, &handle.data)?;
                value.state().restore(handle.binding);
                if handle.binding.owner == Some(id) && !handle.binding.is_uninitialized {
                    restored.push((id, Arc::clone(&value)));
                }
                node.handles.insert(handle.key, value);
            }
        }

        for (owner, handle) in restored {
            let mut ctx = HandleContext::new(owner, &mut executor.tree, &mut executor.blockers);
            handle
                .on_restored(&mut ctx)
                .map_err(|err| PersistenceError::Corrupt(format!("{} on {owner}: {err}", handle.type_name())))?;
        }

        tracing::debug!(
            workflow = %self.workflow_id,
            instances = executor.tree.len(),
            pending = executor.pending_work(),
            "executor restored"
        );
        Ok(executor)
    }
}
