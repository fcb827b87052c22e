//! Activity instances and the instance tree
//!
//! Instances live in an arena addressed by [`InstanceId`]. Parent links and
//! handle owners are ids rather than pointers, so the tree has a single
//! owner and no reference cycles. A released slot bumps its generation;
//! ids that outlive their instance stop resolving instead of aliasing the
//! next occupant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::activity::{Activity, DefinitionId};
use super::error::{ContractError, ContractResult};
use super::handle::Handle;
use super::location::Environment;
use super::properties::PropertyScope;

/// Lifecycle state of an activity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    /// Running or suspended on a bookmark
    Executing,
    /// Completed normally
    Closed,
    /// Completed through cancellation
    Canceled,
    /// Completed with a fault
    Faulted,
}

impl ActivityInstanceState {
    /// Closed, Canceled or Faulted
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActivityInstanceState::Executing)
    }
}

/// Stable arena address of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    /// Slot index
    pub index: u32,
    /// Slot generation at allocation time
    pub generation: u32,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// One node of the executing tree
pub struct ActivityInstance {
    id: InstanceId,
    activity: Arc<Activity>,
    state: ActivityInstanceState,
    parent: Option<InstanceId>,
    children: Vec<InstanceId>,
    pub(crate) properties: PropertyScope,
    pub(crate) handles: BTreeMap<String, Arc<dyn Handle>>,
    pub(crate) environment: Environment,
    pub(crate) completion: Option<String>,
    pub(crate) fault_callback: Option<String>,
    pub(crate) cancel_requested: bool,
    pub(crate) marked_canceled: bool,
}

impl ActivityInstance {
    fn new(id: InstanceId, activity: Arc<Activity>, parent: Option<InstanceId>, environment: Environment) -> Self {
        Self {
            id,
            activity,
            state: ActivityInstanceState::Executing,
            parent,
            children: Vec::new(),
            properties: PropertyScope::default(),
            handles: BTreeMap::new(),
            environment,
            completion: None,
            fault_callback: None,
            cancel_requested: false,
            marked_canceled: false,
        }
    }

    /// Arena id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Activity being executed
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Lifecycle state
    pub fn state(&self) -> ActivityInstanceState {
        self.state
    }

    /// Parent instance, `None` at the root
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Live children in scheduling order
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Location values
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Whether a cancellation request is pending
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Registered handle keys
    pub fn handle_keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }
}

impl fmt::Debug for ActivityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityInstance")
            .field("id", &self.id)
            .field("activity", &self.activity.display_name())
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

struct Slot {
    generation: u32,
    instance: Option<ActivityInstance>,
}

/// Restorable content of one arena slot
pub(crate) struct SlotParts {
    pub generation: u32,
    pub instance: Option<RestoredInstance>,
}

/// Instance fields read back from a snapshot
pub(crate) struct RestoredInstance {
    pub activity: Arc<Activity>,
    pub state: ActivityInstanceState,
    pub parent: Option<InstanceId>,
    pub children: Vec<InstanceId>,
    pub environment: Environment,
    pub completion: Option<String>,
    pub fault_callback: Option<String>,
    pub cancel_requested: bool,
    pub marked_canceled: bool,
}

/// Arena-backed instance tree
#[derive(Default)]
pub struct InstanceTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: Option<InstanceId>,
}

impl InstanceTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Root id, once scheduled (stays set after the root is released)
    pub fn root(&self) -> Option<InstanceId> {
        self.root
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.instance.is_some()).count()
    }

    /// No live instances
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` addresses a live instance
    pub fn contains(&self, id: InstanceId) -> bool {
        self.get(id).is_ok()
    }

    /// Borrow an instance
    pub fn get(&self, id: InstanceId) -> ContractResult<&ActivityInstance> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.instance.as_ref())
            .ok_or(ContractError::UnknownInstance(id))
    }

    /// Mutably borrow an instance
    pub fn get_mut(&mut self, id: InstanceId) -> ContractResult<&mut ActivityInstance> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.instance.as_mut())
            .ok_or(ContractError::UnknownInstance(id))
    }

    /// Parent of a live instance
    pub fn parent_of(&self, id: InstanceId) -> ContractResult<Option<InstanceId>> {
        Ok(self.get(id)?.parent)
    }

    /// Whether a live instance is Executing
    pub fn is_executing(&self, id: InstanceId) -> bool {
        self.get(id)
            .is_ok_and(|instance| instance.state == ActivityInstanceState::Executing)
    }

    /// Schedule the root instance
    pub fn create_root(&mut self, activity: Arc<Activity>, environment: Environment) -> ContractResult<InstanceId> {
        if self.root.is_some() {
            return Err(ContractError::RootAlreadyScheduled);
        }
        activity.ensure_schedulable()?;
        let id = self.allocate(activity, None, environment);
        self.root = Some(id);
        Ok(id)
    }

    /// Attach a new Executing child under an Executing parent
    pub fn create_child(
        &mut self,
        parent: InstanceId,
        activity: Arc<Activity>,
        environment: Environment,
    ) -> ContractResult<InstanceId> {
        let parent_state = self.get(parent)?.state;
        if parent_state != ActivityInstanceState::Executing {
            return Err(ContractError::InvalidStateTransition {
                instance: parent,
                from: parent_state,
                to: ActivityInstanceState::Executing,
            });
        }
        activity.ensure_schedulable()?;

        let id = self.allocate(activity, Some(parent), environment);
        self.get_mut(parent)?.children.push(id);
        Ok(id)
    }

    fn allocate(&mut self, activity: Arc<Activity>, parent: Option<InstanceId>, environment: Environment) -> InstanceId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let id = InstanceId {
                    index,
                    generation: slot.generation,
                };
                slot.instance = Some(ActivityInstance::new(id, activity, parent, environment));
                id
            }
            None => {
                let id = InstanceId {
                    index: self.slots.len() as u32,
                    generation: 0,
                };
                self.slots.push(Slot {
                    generation: 0,
                    instance: Some(ActivityInstance::new(id, activity, parent, environment)),
                });
                id
            }
        }
    }

    /// Move an Executing instance to a terminal state.
    ///
    /// Fails if the instance already left Executing or still has children.
    pub fn complete(&mut self, id: InstanceId, outcome: ActivityInstanceState) -> ContractResult<()> {
        let instance = self.get_mut(id)?;
        if instance.state.is_terminal() || !outcome.is_terminal() {
            return Err(ContractError::InvalidStateTransition {
                instance: id,
                from: instance.state,
                to: outcome,
            });
        }
        if !instance.children.is_empty() {
            return Err(ContractError::OutstandingChildren {
                instance: id,
                count: instance.children.len(),
            });
        }
        instance.state = outcome;
        Ok(())
    }

    /// Remove a terminal instance from the arena and detach it from its parent
    pub fn release(&mut self, id: InstanceId) -> ContractResult<ActivityInstance> {
        let instance = self.get(id)?;
        if !instance.state.is_terminal() {
            return Err(ContractError::InvalidStateTransition {
                instance: id,
                from: instance.state,
                to: instance.state,
            });
        }
        if !instance.children.is_empty() {
            return Err(ContractError::OutstandingChildren {
                instance: id,
                count: instance.children.len(),
            });
        }
        let parent = instance.parent;

        let slot = &mut self.slots[id.index as usize];
        let released = slot.instance.take().ok_or(ContractError::UnknownInstance(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        if let Some(parent) = parent {
            if let Ok(parent) = self.get_mut(parent) {
                parent.children.retain(|child| *child != id);
            }
        }
        Ok(released)
    }

    /// `id` followed by its ancestors up to the root
    pub fn chain(&self, id: InstanceId) -> ContractResult<Vec<InstanceId>> {
        let mut chain = vec![id];
        let mut cursor = self.get(id)?.parent;
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.get(current)?.parent;
        }
        Ok(chain)
    }

    /// All descendants of `id`, children before their parents
    pub fn descendants_post_order(&self, id: InstanceId) -> ContractResult<Vec<InstanceId>> {
        let mut order = Vec::new();
        for child in &self.get(id)?.children {
            order.extend(self.descendants_post_order(*child)?);
            order.push(*child);
        }
        Ok(order)
    }

    /// Ids of live instances
    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.instance.as_ref().map(|instance| instance.id))
    }

    pub(crate) fn slot_generations(&self) -> impl Iterator<Item = (u32, Option<&ActivityInstance>)> {
        self.slots
            .iter()
            .map(|slot| (slot.generation, slot.instance.as_ref()))
    }

    pub(crate) fn from_parts(slots: Vec<SlotParts>, root: Option<InstanceId>) -> Self {
        let mut free = Vec::new();
        let slots = slots
            .into_iter()
            .enumerate()
            .map(|(index, parts)| {
                let id = InstanceId {
                    index: index as u32,
                    generation: parts.generation,
                };
                let instance = parts.instance.map(|restored| ActivityInstance {
                    id,
                    activity: restored.activity,
                    state: restored.state,
                    parent: restored.parent,
                    children: restored.children,
                    properties: PropertyScope::default(),
                    handles: BTreeMap::new(),
                    environment: restored.environment,
                    completion: restored.completion,
                    fault_callback: restored.fault_callback,
                    cancel_requested: restored.cancel_requested,
                    marked_canceled: restored.marked_canceled,
                });
                if instance.is_none() {
                    free.push(index as u32);
                }
                Slot {
                    generation: parts.generation,
                    instance,
                }
            })
            .collect();
        free.reverse();
        Self { slots, free, root }
    }
}

/// Report delivered to a parent when a child completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedChild {
    /// Child instance (already released)
    pub instance: InstanceId,
    /// Child activity
    pub activity: DefinitionId,
    /// Child display name
    pub display_name: String,
    /// Terminal state
    pub state: ActivityInstanceState,
    /// Out/InOut argument values
    pub outputs: BTreeMap<String, Value>,
}

/// An in-workflow fault wrapped with the instance that raised it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "FaultSummary", from = "FaultSummary")]
pub struct FaultRecord {
    /// The error raised by activity code
    pub error: Arc<anyhow::Error>,
    /// Instance that raised it
    pub source: InstanceId,
    /// Display name of the raising activity
    pub activity: String,
}

impl FaultRecord {
    /// Wrap an error raised by `source`
    pub fn new(error: anyhow::Error, source: InstanceId, activity: impl Into<String>) -> Self {
        Self {
            error: Arc::new(error),
            source,
            activity: activity.into(),
        }
    }

    /// Formatted error chain
    pub fn message(&self) -> String {
        format!("{:#}", self.error)
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {:#}", self.activity, self.source, self.error)
    }
}

#[derive(Serialize, Deserialize)]
struct FaultSummary {
    source: InstanceId,
    activity: String,
    message: String,
}

impl From<FaultRecord> for FaultSummary {
    fn from(record: FaultRecord) -> Self {
        Self {
            message: record.message(),
            source: record.source,
            activity: record.activity,
        }
    }
}

impl From<FaultSummary> for FaultRecord {
    fn from(summary: FaultSummary) -> Self {
        Self::new(anyhow::anyhow!(summary.message), summary.source, summary.activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::WorkflowDefinition;

    fn definition() -> Arc<WorkflowDefinition> {
        let leaf = |name: &str| Activity::code(name, |_ctx| Ok(()));
        WorkflowDefinition::new("tree", "1", leaf("root").with_child(leaf("a")).with_child(leaf("b"))).unwrap()
    }

    fn tree_with_children() -> (InstanceTree, InstanceId, InstanceId, InstanceId) {
        let def = definition();
        let root_activity = Arc::clone(def.root());
        let a = Arc::clone(&root_activity.children()[0]);
        let b = Arc::clone(&root_activity.children()[1]);

        let mut tree = InstanceTree::new();
        let root = tree.create_root(root_activity, Environment::default()).unwrap();
        let a = tree.create_child(root, a, Environment::default()).unwrap();
        let b = tree.create_child(root, b, Environment::default()).unwrap();
        (tree, root, a, b)
    }

    #[test]
    fn test_create_child_links_parent() {
        let (tree, root, a, b) = tree_with_children();
        assert_eq!(tree.get(root).unwrap().children(), &[a, b]);
        assert_eq!(tree.parent_of(a).unwrap(), Some(root));
        assert_eq!(tree.chain(a).unwrap(), vec![a, root]);
        assert!(tree.is_executing(b));
    }

    #[test]
    fn test_second_root_is_rejected() {
        let def = definition();
        let mut tree = InstanceTree::new();
        tree.create_root(Arc::clone(def.root()), Environment::default()).unwrap();
        let err = tree.create_root(Arc::clone(def.root()), Environment::default());
        assert_eq!(err.err(), Some(ContractError::RootAlreadyScheduled));
    }

    #[test]
    fn test_complete_requires_terminal_children() {
        let (mut tree, root, a, _b) = tree_with_children();
        let err = tree.complete(root, ActivityInstanceState::Closed).unwrap_err();
        assert_eq!(
            err,
            ContractError::OutstandingChildren {
                instance: root,
                count: 2
            }
        );

        tree.complete(a, ActivityInstanceState::Closed).unwrap();
        let err = tree.complete(a, ActivityInstanceState::Faulted).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidStateTransition {
                from: ActivityInstanceState::Closed,
                to: ActivityInstanceState::Faulted,
                ..
            }
        ));
    }

    #[test]
    fn test_complete_rejects_executing_target() {
        let (mut tree, _root, a, _b) = tree_with_children();
        assert!(tree.complete(a, ActivityInstanceState::Executing).is_err());
        assert!(tree.is_executing(a));
    }

    #[test]
    fn test_release_bumps_generation() {
        let (mut tree, root, a, b) = tree_with_children();
        tree.complete(a, ActivityInstanceState::Canceled).unwrap();
        let released = tree.release(a).unwrap();
        assert_eq!(released.state(), ActivityInstanceState::Canceled);
        assert_eq!(tree.get(root).unwrap().children(), &[b]);
        assert_eq!(tree.get(a).err(), Some(ContractError::UnknownInstance(a)));

        let activity = Arc::clone(tree.get(b).unwrap().activity());
        let reused = tree.create_child(root, activity, Environment::default()).unwrap();
        assert_eq!(reused.index, a.index);
        assert_ne!(reused.generation, a.generation);
        assert!(!tree.contains(a));
    }

    #[test]
    fn test_child_of_terminal_parent_is_rejected() {
        let (mut tree, _root, a, _b) = tree_with_children();
        tree.complete(a, ActivityInstanceState::Closed).unwrap();
        let activity = Arc::clone(tree.get(a).unwrap().activity());
        assert!(matches!(
            tree.create_child(a, activity, Environment::default()),
            Err(ContractError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_descendants_post_order() {
        let (mut tree, root, a, b) = tree_with_children();
        let activity = Arc::clone(tree.get(b).unwrap().activity());
        let nested = tree.create_child(a, activity, Environment::default()).unwrap();
        assert_eq!(tree.descendants_post_order(root).unwrap(), vec![nested, a, b]);
    }
}
