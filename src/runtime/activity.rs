//! Activity definitions, behaviours and metadata caching
//!
//! An [`Activity`] is an immutable node of the definition tree. Its
//! behaviour is supplied through [`ActivityBehavior`]; everything an
//! activity does at runtime goes through the context it receives.
//! Metadata caching assigns definition ids and location identities, then
//! freezes the tree so the executor may schedule it.

use blake3::Hasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::bookmark::Bookmark;
use super::context::{CodeActivityContext, FaultContext, NativeActivityContext, TransactionContext};
use super::error::{ContractError, ContractResult};
use super::flags::CacheState;
use super::instance::{CompletedChild, FaultRecord};
use super::location::{Argument, LocationId, LocationReference, TypedLocation, Variable};

/// Result type returned by activity code
pub type ActivityResult<T = ()> = anyhow::Result<T>;

/// Preorder index of an activity within its workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionId(pub u32);

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime behaviour of an activity.
///
/// Callbacks are addressed by name so they survive persistence: a parent
/// registers `"on_done"` when scheduling a child and later receives that
/// name back in [`on_child_completed`](Self::on_child_completed).
pub trait ActivityBehavior: Send + Sync + 'static {
    /// Run the activity
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult;

    /// React to a cancellation request.
    ///
    /// The default cancels every running child and marks the instance
    /// canceled once they finish.
    fn cancel(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        ctx.cancel_children()?;
        ctx.mark_canceled()?;
        Ok(())
    }

    /// A bookmark owned by this instance was resumed
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        bookmark: &Bookmark,
        callback: &str,
        _payload: Value,
    ) -> ActivityResult {
        anyhow::bail!("no bookmark callback '{callback}' for {bookmark}")
    }

    /// A child scheduled with a completion callback finished
    fn on_child_completed(
        &self,
        _ctx: &mut NativeActivityContext<'_>,
        _callback: &str,
        _child: &CompletedChild,
    ) -> ActivityResult {
        Ok(())
    }

    /// A child scheduled with a fault callback faulted.
    ///
    /// The fault keeps propagating unless `ctx.handle_fault()` is called.
    fn on_child_faulted(
        &self,
        _ctx: &mut FaultContext<'_, '_>,
        _callback: &str,
        _fault: &FaultRecord,
    ) -> ActivityResult {
        Ok(())
    }

    /// A transaction context requested through a runtime transaction handle
    fn on_transaction_context(
        &self,
        _ctx: &mut TransactionContext<'_, '_>,
        callback: &str,
    ) -> ActivityResult {
        anyhow::bail!("no transaction callback '{callback}'")
    }
}

/// Body of a leaf activity
pub trait CodeActivityBody: Send + Sync + 'static {
    /// Run the body
    fn run(&self, ctx: &mut CodeActivityContext<'_, '_>) -> ActivityResult;
}

impl<F> CodeActivityBody for F
where
    F: Fn(&mut CodeActivityContext<'_, '_>) -> ActivityResult + Send + Sync + 'static,
{
    fn run(&self, ctx: &mut CodeActivityContext<'_, '_>) -> ActivityResult {
        self(ctx)
    }
}

/// Adapts a [`CodeActivityBody`] to the full behaviour trait with a restricted view
pub struct CodeActivity<B> {
    body: B,
}

impl<B: CodeActivityBody> CodeActivity<B> {
    /// Wrap a body
    pub fn new(body: B) -> Self {
        Self { body }
    }
}

impl<B: CodeActivityBody> ActivityBehavior for CodeActivity<B> {
    fn execute(&self, ctx: &mut NativeActivityContext<'_>) -> ActivityResult {
        let mut restricted = CodeActivityContext::new(ctx);
        self.body.run(&mut restricted)
    }
}

#[derive(Debug, Default)]
struct ActivityMetadata {
    id: Option<DefinitionId>,
    cache_state: CacheState,
    subtree_has_constraints: Option<bool>,
}

/// A node of the workflow definition tree
pub struct Activity {
    display_name: String,
    behavior: Arc<dyn ActivityBehavior>,
    children: Vec<Arc<Activity>>,
    locations: Vec<Arc<LocationReference>>,
    constraints: usize,
    metadata: RwLock<ActivityMetadata>,
}

impl Activity {
    /// Create an activity with a custom behaviour
    pub fn new(display_name: impl Into<String>, behavior: impl ActivityBehavior) -> Self {
        Self {
            display_name: display_name.into(),
            behavior: Arc::new(behavior),
            children: Vec::new(),
            locations: Vec::new(),
            constraints: 0,
            metadata: RwLock::new(ActivityMetadata::default()),
        }
    }

    /// Create a leaf activity from a closure
    pub fn code<F>(display_name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut CodeActivityContext<'_, '_>) -> ActivityResult + Send + Sync + 'static,
    {
        Self::new(display_name, CodeActivity::new(body))
    }

    /// Append a child activity
    pub fn with_child(mut self, child: impl Into<Arc<Activity>>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Declare a variable
    pub fn with_variable<T>(mut self, variable: &Variable<T>) -> Self {
        self.locations.push(Arc::clone(variable.reference()));
        self
    }

    /// Declare an argument
    pub fn with_argument<T>(mut self, argument: &Argument<T>) -> Self {
        self.locations.push(Arc::clone(argument.reference()));
        self
    }

    /// Declare a constraint (only counted)
    pub fn with_constraint(mut self) -> Self {
        self.constraints += 1;
        self
    }

    /// Display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Shared behaviour
    pub fn behavior(&self) -> Arc<dyn ActivityBehavior> {
        Arc::clone(&self.behavior)
    }

    /// Child activities in declaration order
    pub fn children(&self) -> &[Arc<Activity>] {
        &self.children
    }

    /// Declared locations in declaration order
    pub fn locations(&self) -> &[Arc<LocationReference>] {
        &self.locations
    }

    /// Number of declared constraints
    pub fn constraint_count(&self) -> usize {
        self.constraints
    }

    /// Definition id, once cached
    pub fn id(&self) -> Option<DefinitionId> {
        self.metadata.read().id
    }

    /// Current cache state
    pub fn cache_state(&self) -> CacheState {
        self.metadata.read().cache_state
    }

    /// Roll-up computed by a full cache pass
    pub fn subtree_has_constraints(&self) -> Option<bool> {
        self.metadata.read().subtree_has_constraints
    }

    /// Fail unless the activity may be scheduled
    pub fn ensure_schedulable(&self) -> ContractResult<()> {
        let state = self.cache_state();
        if state.is_schedulable() {
            Ok(())
        } else {
            Err(ContractError::NotSchedulable {
                activity: self.display_name.clone(),
                cache_state: state.bits(),
            })
        }
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("display_name", &self.display_name)
            .field("id", &self.id())
            .field("cache_state", &self.cache_state())
            .field("children", &self.children.len())
            .finish()
    }
}

/// How deep a cache pass resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDepth {
    /// The activity only
    Partial,
    /// The activity and all descendants
    Full,
}

/// Assigns definition ids and location identities, then freezes
#[derive(Default)]
pub struct MetadataCache {
    activities: Vec<Arc<Activity>>,
}

impl MetadataCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve metadata for `root` to the given depth
    pub fn cache(&mut self, root: &Arc<Activity>, depth: CacheDepth) -> ContractResult<()> {
        let mut visited = HashSet::new();
        match depth {
            CacheDepth::Partial => self.cache_one(root, depth, &mut visited),
            CacheDepth::Full => self.cache_subtree(root, &mut visited).map(|_| ()),
        }
    }

    fn cache_subtree(
        &mut self,
        activity: &Arc<Activity>,
        visited: &mut HashSet<usize>,
    ) -> ContractResult<bool> {
        self.cache_one(activity, CacheDepth::Full, visited)?;
        let mut has_constraints = activity.constraints > 0;
        for child in &activity.children {
            has_constraints |= self.cache_subtree(child, visited)?;
        }
        activity.metadata.write().subtree_has_constraints = Some(has_constraints);
        Ok(has_constraints)
    }

    fn cache_one(
        &mut self,
        activity: &Arc<Activity>,
        depth: CacheDepth,
        visited: &mut HashSet<usize>,
    ) -> ContractResult<()> {
        if !visited.insert(Arc::as_ptr(activity) as usize) {
            return Err(ContractError::ActivityReused(activity.display_name.clone()));
        }

        let mut metadata = activity.metadata.write();
        let next = match depth {
            CacheDepth::Partial => metadata.cache_state.with_partial(),
            CacheDepth::Full => metadata.cache_state.with_full(),
        }
        .ok_or_else(|| ContractError::MetadataFrozen(activity.display_name.clone()))?;

        let id = match metadata.id {
            Some(id) => id,
            None => {
                let id = DefinitionId(self.activities.len() as u32);
                self.activities.push(Arc::clone(activity));
                id
            }
        };

        for (index, location) in activity.locations.iter().enumerate() {
            location.bind_id(LocationId {
                owner: id,
                index: index as u32,
            })?;
        }

        metadata.id = Some(id);
        metadata.cache_state = next;
        tracing::trace!(activity = %activity.display_name, %id, state = %next, "cached activity metadata");
        Ok(())
    }

    /// OR in RuntimeReady on everything cached so far
    pub fn freeze(&self) {
        for activity in &self.activities {
            let mut metadata = activity.metadata.write();
            metadata.cache_state = metadata.cache_state.with_runtime_ready();
        }
    }

    /// Cached activities indexed by definition id
    pub fn activities(&self) -> &[Arc<Activity>] {
        &self.activities
    }
}

/// Identity a persisted instance is checked against on load
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    /// Workflow name
    pub name: String,
    /// Host-assigned version label
    pub version: String,
    /// blake3 hash over the definition tree structure
    pub fingerprint: String,
}

impl fmt::Display for WorkflowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.fingerprint.get(..12).unwrap_or(&self.fingerprint);
        write!(f, "{}@{} ({})", self.name, self.version, short)
    }
}

/// A fully cached and frozen workflow ready for execution
pub struct WorkflowDefinition {
    root: Arc<Activity>,
    activities: Vec<Arc<Activity>>,
    identity: WorkflowIdentity,
}

impl WorkflowDefinition {
    /// Cache `root` fully, freeze it and compute the identity
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        root: impl Into<Arc<Activity>>,
    ) -> ContractResult<Arc<Self>> {
        let root = root.into();
        let mut cache = MetadataCache::new();
        cache.cache(&root, CacheDepth::Full)?;

        let activities = cache.activities().to_vec();
        for (index, activity) in activities.iter().enumerate() {
            if activity.id() != Some(DefinitionId(index as u32)) {
                return Err(ContractError::ActivityReused(activity.display_name.clone()));
            }
        }
        cache.freeze();

        let identity = WorkflowIdentity {
            name: name.into(),
            version: version.into(),
            fingerprint: fingerprint(&activities),
        };
        tracing::debug!(%identity, activities = activities.len(), "workflow definition ready");

        Ok(Arc::new(Self {
            root,
            activities,
            identity,
        }))
    }

    /// Root activity
    pub fn root(&self) -> &Arc<Activity> {
        &self.root
    }

    /// Activity by definition id
    pub fn activity(&self, id: DefinitionId) -> Option<&Arc<Activity>> {
        self.activities.get(id.0 as usize)
    }

    /// Whether `activity` belongs to this definition
    pub fn contains(&self, activity: &Arc<Activity>) -> bool {
        activity
            .id()
            .and_then(|id| self.activity(id))
            .is_some_and(|known| Arc::ptr_eq(known, activity))
    }

    /// Number of activities
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Always false for a constructed definition
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Identity
    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }
}

fn fingerprint(preorder: &[Arc<Activity>]) -> String {
    let mut hasher = Hasher::new();
    for activity in preorder {
        hasher.update(activity.display_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(activity.children.len() as u32).to_le_bytes());
        hasher.update(&(activity.constraints as u32).to_le_bytes());
        for location in &activity.locations {
            location.fingerprint_into(&mut hasher);
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> Activity {
        Activity::code(name, |_ctx| Ok(()))
    }

    #[test]
    fn test_full_cache_assigns_preorder_ids() {
        let root = Arc::new(
            leaf("root")
                .with_child(leaf("a").with_child(leaf("a1")))
                .with_child(leaf("b")),
        );
        let def = WorkflowDefinition::new("wf", "1", Arc::clone(&root)).unwrap();

        let names: Vec<_> = (0..def.len())
            .map(|i| def.activity(DefinitionId(i as u32)).unwrap().display_name().to_string())
            .collect();
        assert_eq!(names, ["root", "a", "a1", "b"]);
        assert!(root.cache_state().is_schedulable());
        assert!(root.cache_state().is_full());
    }

    #[test]
    fn test_partial_cache_skips_children() {
        let root = Arc::new(leaf("root").with_child(leaf("child")));
        let mut cache = MetadataCache::new();
        cache.cache(&root, CacheDepth::Partial).unwrap();
        cache.freeze();

        assert_eq!(root.cache_state(), CacheState::PARTIAL.with_runtime_ready());
        assert!(root.ensure_schedulable().is_ok());
        let child = &root.children()[0];
        assert_eq!(child.cache_state(), CacheState::UNCACHED);
        assert!(matches!(
            child.ensure_schedulable(),
            Err(ContractError::NotSchedulable { cache_state: 0, .. })
        ));
        assert_eq!(root.subtree_has_constraints(), None);
    }

    #[test]
    fn test_partial_upgrades_to_full_before_freeze() {
        let root = Arc::new(leaf("root").with_child(leaf("child").with_constraint()));
        let mut cache = MetadataCache::new();
        cache.cache(&root, CacheDepth::Partial).unwrap();
        cache.cache(&root, CacheDepth::Full).unwrap();

        assert_eq!(root.cache_state(), CacheState::FULL);
        assert_eq!(root.id(), Some(DefinitionId(0)));
        assert_eq!(root.children()[0].id(), Some(DefinitionId(1)));
        assert_eq!(root.subtree_has_constraints(), Some(true));
    }

    #[test]
    fn test_frozen_metadata_rejects_recache() {
        let root = Arc::new(leaf("root"));
        WorkflowDefinition::new("wf", "1", Arc::clone(&root)).unwrap();
        let mut cache = MetadataCache::new();
        assert_eq!(
            cache.cache(&root, CacheDepth::Full),
            Err(ContractError::MetadataFrozen("root".into()))
        );
    }

    #[test]
    fn test_reused_activity_is_rejected() {
        let shared = Arc::new(leaf("shared"));
        let root = leaf("root")
            .with_child(Arc::clone(&shared))
            .with_child(Arc::clone(&shared));
        let err = WorkflowDefinition::new("wf", "1", root).err();
        assert_eq!(err, Some(ContractError::ActivityReused("shared".into())));
    }

    #[test]
    fn test_location_ids_follow_declaration_order() {
        let x = Variable::<i64>::new("x");
        let y = Argument::<String>::input("y");
        let root = leaf("root").with_variable(&x).with_argument(&y);
        WorkflowDefinition::new("wf", "1", root).unwrap();

        assert_eq!(
            x.reference().id(),
            Some(LocationId {
                owner: DefinitionId(0),
                index: 0
            })
        );
        assert_eq!(y.reference().id().map(|id| id.index), Some(1));
    }

    #[test]
    fn test_identity_tracks_structure() {
        let a = WorkflowDefinition::new("wf", "1", leaf("root").with_child(leaf("a"))).unwrap();
        let b = WorkflowDefinition::new("wf", "1", leaf("root").with_child(leaf("a"))).unwrap();
        let c = WorkflowDefinition::new("wf", "1", leaf("root").with_child(leaf("b"))).unwrap();

        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity().fingerprint, c.identity().fingerprint);
        assert!(a.identity().to_string().starts_with("wf@1 ("));
    }
}
