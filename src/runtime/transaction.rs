//! Ambient runtime transactions
//!
//! A [`RuntimeTransactionHandle`] owns a transaction slot shared with an
//! [`AmbientTransactionProperty`] registered at the handle's owner. Only a
//! [`TransactionContext`](super::context::TransactionContext) requested
//! through the handle can fill the slot; descendants read it through the
//! property chain. The executor records the active transaction in its
//! [`PersistenceBlockers`], which keeps persistence blocked until the
//! owning scope completes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ContractError, ContractResult};
use super::handle::{Handle, HandleContext, HandleState, HandleType};
use super::instance::{InstanceId, InstanceTree};
use super::no_persist::PersistenceBlockers;
use super::properties::{self, ExecutionProperty, PropertyOptions};

/// Scope key of the ambient transaction property
pub const AMBIENT_TRANSACTION_PROPERTY: &str = "runtime.ambient-transaction";

/// Isolation level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read committed
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    #[default]
    Serializable,
    /// Snapshot
    Snapshot,
}

/// A transaction exposed to a subtree
pub trait Transaction: Send + Sync + fmt::Debug + 'static {
    /// Identity
    fn id(&self) -> Uuid;

    /// Isolation level
    fn isolation_level(&self) -> IsolationLevel;
}

/// Outcome of a [`CommittableTransaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not yet resolved
    Active,
    /// Committed
    Committed,
    /// Rolled back
    Aborted,
}

/// In-memory transaction resolved by the code that created it
#[derive(Debug)]
pub struct CommittableTransaction {
    id: Uuid,
    isolation_level: IsolationLevel,
    status: Mutex<TransactionStatus>,
}

impl CommittableTransaction {
    /// New active transaction
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            isolation_level,
            status: Mutex::new(TransactionStatus::Active),
        }
    }

    /// Commit; false if already resolved
    pub fn commit(&self) -> bool {
        self.resolve(TransactionStatus::Committed)
    }

    /// Roll back; false if already resolved
    pub fn rollback(&self) -> bool {
        self.resolve(TransactionStatus::Aborted)
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn resolve(&self, to: TransactionStatus) -> bool {
        let mut status = self.status.lock();
        if *status != TransactionStatus::Active {
            return false;
        }
        *status = to;
        true
    }
}

impl Transaction for CommittableTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }
}

/// Slot shared between a handle and its ambient property
pub type TransactionSlot = Arc<Mutex<Option<Arc<dyn Transaction>>>>;

/// The executor's record of the active runtime transaction
#[derive(Debug, Clone)]
pub struct RuntimeTransactionData {
    /// Handle that set it
    pub handle_id: Uuid,
    /// Instance owning that handle
    pub owner: InstanceId,
    /// The transaction
    pub transaction: Arc<dyn Transaction>,
}

/// Read side of the ambient transaction, visible to descendants
#[derive(Debug)]
pub struct AmbientTransactionProperty {
    handle_id: Uuid,
    slot: TransactionSlot,
}

impl AmbientTransactionProperty {
    /// Handle that owns the slot
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }

    /// Current transaction
    pub fn transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.slot.lock().clone()
    }
}

impl ExecutionProperty for AmbientTransactionProperty {}

/// Handle that introduces an ambient transaction for its owner's subtree
#[derive(Debug)]
pub struct RuntimeTransactionHandle {
    state: HandleState,
    id: Uuid,
    slot: TransactionSlot,
}

impl RuntimeTransactionHandle {
    /// New handle with a fresh identity
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub(crate) fn with_id(id: Uuid) -> Self {
        Self {
            state: HandleState::default(),
            id,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transaction set through this handle
    pub fn transaction(&self) -> ContractResult<Option<Arc<dyn Transaction>>> {
        self.state.ensure_initialized(Self::TYPE_NAME)?;
        Ok(self.slot.lock().clone())
    }

    /// Owner, checked against the calling instance
    pub(crate) fn ensure_owned_by(&self, caller: InstanceId) -> ContractResult<()> {
        let owner = self.state.ensure_initialized(Self::TYPE_NAME)?;
        if owner != caller {
            return Err(ContractError::HandleOwnerMismatch {
                handle: Self::TYPE_NAME.to_string(),
                owner,
                caller,
            });
        }
        Ok(())
    }

    /// Install `transaction` as the executor's runtime transaction.
    ///
    /// Fails when another handle, or this handle for a different owner,
    /// already holds it, or when the ambient slot at the owner's scope
    /// belongs to another handle. The first set enters no-persist.
    pub(crate) fn set_transaction(
        &self,
        tree: &InstanceTree,
        blockers: &mut PersistenceBlockers,
        caller: InstanceId,
        transaction: Arc<dyn Transaction>,
    ) -> ContractResult<()> {
        self.ensure_owned_by(caller)?;
        if blockers
            .runtime_transaction
            .as_ref()
            .is_some_and(|active| active.handle_id != self.id || active.owner != caller)
        {
            return Err(ContractError::TransactionAlreadySet);
        }
        let owns_slot = properties::find_at_current_scope(tree, caller, AMBIENT_TRANSACTION_PROPERTY)?
            .and_then(properties::downcast::<AmbientTransactionProperty>)
            .is_some_and(|property| property.handle_id == self.id);
        if !owns_slot {
            return Err(ContractError::AmbientSlotNotOwned { handle: self.id });
        }

        match blockers.runtime_transaction.as_mut() {
            Some(active) => active.transaction = Arc::clone(&transaction),
            None => {
                blockers.no_persist.enter();
                blockers.runtime_transaction = Some(RuntimeTransactionData {
                    handle_id: self.id,
                    owner: caller,
                    transaction: Arc::clone(&transaction),
                });
            }
        }
        tracing::debug!(instance = %caller, transaction = %transaction.id(), "runtime transaction set");
        *self.slot.lock() = Some(transaction);
        Ok(())
    }

    fn register_property(&self, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        // a second handle at the same scope shares the first one's property
        if ctx
            .find_property_at_current_scope(AMBIENT_TRANSACTION_PROPERTY)?
            .is_some()
        {
            return Ok(());
        }
        ctx.add_property(
            AMBIENT_TRANSACTION_PROPERTY,
            Arc::new(AmbientTransactionProperty {
                handle_id: self.id,
                slot: Arc::clone(&self.slot),
            }),
            PropertyOptions::runtime(true),
        )
    }
}

impl Default for RuntimeTransactionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle for RuntimeTransactionHandle {
    fn state(&self) -> &HandleState {
        &self.state
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn on_initialize(&self, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        self.register_property(ctx)
    }

    fn on_uninitialize(&self, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        self.slot.lock().take();

        let blockers = ctx.blockers();
        if blockers
            .runtime_transaction
            .as_ref()
            .is_some_and(|active| active.handle_id == self.id)
        {
            blockers.runtime_transaction = None;
            blockers.no_persist.exit()?;
            tracing::debug!(instance = %ctx.owner(), "runtime transaction cleared");
        }

        let ours = ctx
            .find_property_at_current_scope(AMBIENT_TRANSACTION_PROPERTY)?
            .and_then(properties::downcast::<AmbientTransactionProperty>)
            .is_some_and(|property| property.handle_id == self.id);
        if ours {
            ctx.remove_property(AMBIENT_TRANSACTION_PROPERTY)?;
        }
        Ok(())
    }

    fn persisted_data(&self) -> Value {
        json!({ "id": self.id })
    }

    fn on_restored(&self, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        self.register_property(ctx)
    }
}

impl HandleType for RuntimeTransactionHandle {
    const TYPE_NAME: &'static str = "RuntimeTransactionHandle";

    fn create() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{Activity, WorkflowDefinition};
    use crate::runtime::handle;
    use crate::runtime::instance::InstanceTree;
    use crate::runtime::location::Environment;

    fn tree() -> (InstanceTree, InstanceId, InstanceId) {
        let leaf = |name: &str| Activity::code(name, |_ctx| Ok(()));
        let def = WorkflowDefinition::new("tx", "1", leaf("scope").with_child(leaf("inner"))).unwrap();
        let mut tree = InstanceTree::new();
        let root = tree
            .create_root(Arc::clone(def.root()), Environment::default())
            .unwrap();
        let child = tree
            .create_child(root, Arc::clone(&def.root().children()[0]), Environment::default())
            .unwrap();
        (tree, root, child)
    }

    #[test]
    fn test_committable_transaction_resolves_once() {
        let tx = CommittableTransaction::new(IsolationLevel::ReadCommitted);
        assert_eq!(tx.status(), TransactionStatus::Active);
        assert!(tx.commit());
        assert!(!tx.rollback());
        assert_eq!(tx.status(), TransactionStatus::Committed);
    }

    #[test]
    fn test_set_blocks_persistence_until_uninitialize() {
        let (mut tree, root, child) = tree();
        let mut blockers = PersistenceBlockers::default();
        let handle = RuntimeTransactionHandle::new();
        handle::initialize(&handle, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();

        let tx: Arc<dyn Transaction> = Arc::new(CommittableTransaction::new(IsolationLevel::Serializable));
        handle.set_transaction(&tree, &mut blockers, root, Arc::clone(&tx)).unwrap();
        assert!(!blockers.can_persist());
        assert_eq!(blockers.no_persist_count(), 1);

        let seen = properties::find(&tree, child, AMBIENT_TRANSACTION_PROPERTY)
            .unwrap()
            .and_then(properties::downcast::<AmbientTransactionProperty>)
            .and_then(|property| property.transaction())
            .unwrap();
        assert!(Arc::ptr_eq(&seen, &tx));

        handle::uninitialize(&handle, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();
        assert!(blockers.can_persist());
        assert!(properties::find(&tree, child, AMBIENT_TRANSACTION_PROPERTY).unwrap().is_none());
    }

    #[test]
    fn test_second_handle_cannot_replace_transaction() {
        let (mut tree, root, child) = tree();
        let mut blockers = PersistenceBlockers::default();
        let first = RuntimeTransactionHandle::new();
        let second = RuntimeTransactionHandle::new();
        handle::initialize(&first, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();
        handle::initialize(&second, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();

        let tx = Arc::new(CommittableTransaction::new(IsolationLevel::Serializable));
        first.set_transaction(&tree, &mut blockers, root, tx.clone()).unwrap();
        let err = second.set_transaction(&tree, &mut blockers, root, tx.clone());
        assert_eq!(err, Err(ContractError::TransactionAlreadySet));

        let wrong_owner = first.set_transaction(&tree, &mut blockers, child, tx);
        assert!(matches!(wrong_owner, Err(ContractError::HandleOwnerMismatch { .. })));
        assert_eq!(blockers.no_persist_count(), 1);
    }

    #[test]
    fn test_handle_without_the_slot_cannot_set_first() {
        let (mut tree, root, child) = tree();
        let mut blockers = PersistenceBlockers::default();
        let first = RuntimeTransactionHandle::new();
        let second = RuntimeTransactionHandle::new();
        handle::initialize(&first, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();
        handle::initialize(&second, &mut HandleContext::new(root, &mut tree, &mut blockers)).unwrap();

        let tx = Arc::new(CommittableTransaction::new(IsolationLevel::Serializable));
        let err = second.set_transaction(&tree, &mut blockers, root, tx.clone());
        assert_eq!(err, Err(ContractError::AmbientSlotNotOwned { handle: second.id() }));
        assert!(blockers.runtime_transaction.is_none());
        assert!(blockers.can_persist());

        first.set_transaction(&tree, &mut blockers, root, tx).unwrap();
        let seen = properties::find(&tree, child, AMBIENT_TRANSACTION_PROPERTY)
            .unwrap()
            .and_then(properties::downcast::<AmbientTransactionProperty>)
            .and_then(|property| property.transaction());
        assert!(seen.is_some());
    }

    #[test]
    fn test_uninitialized_handle_has_no_transaction() {
        let handle = RuntimeTransactionHandle::new();
        assert_eq!(
            handle.transaction().err(),
            Some(ContractError::HandleUninitialized("RuntimeTransactionHandle".into()))
        );
    }
}
