//! No-persist coordination
//!
//! The executor keeps one [`NoPersistGate`]. Activity code enters and exits
//! it through a [`NoPersistHandle`], which records its own entries in a
//! [`NoPersistProperty`] at the owning instance so scope teardown can give
//! back whatever the activity forgot to exit.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use super::error::{ContractError, ContractResult, PersistenceError, PersistenceResult};
use super::handle::{Handle, HandleContext, HandleState, HandleType};
use super::properties::{self, ExecutionProperty, PropertyOptions, RegistrationContext};
use super::transaction::RuntimeTransactionData;

/// Scope key of the per-instance no-persist bookkeeping
pub const NO_PERSIST_PROPERTY: &str = "runtime.no-persist";

/// Reference count blocking persistence while non-zero
#[derive(Debug, Default)]
pub struct NoPersistGate {
    count: u32,
}

impl NoPersistGate {
    /// Open a no-persist region
    pub fn enter(&mut self) {
        self.count += 1;
        if self.count == 1 {
            tracing::debug!("persistence blocked");
        }
    }

    /// Close a region; true exactly when the count reaches zero
    pub fn exit(&mut self) -> ContractResult<bool> {
        if self.count == 0 {
            return Err(ContractError::NoPersistUnderflow);
        }
        self.count -= 1;
        if self.count == 0 {
            tracing::debug!("persistence unblocked");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Outstanding entries
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Count is non-zero
    pub fn is_blocked(&self) -> bool {
        self.count > 0
    }
}

/// Everything that can veto a checkpoint
#[derive(Debug, Default)]
pub struct PersistenceBlockers {
    pub(crate) no_persist: NoPersistGate,
    pub(crate) runtime_transaction: Option<RuntimeTransactionData>,
}

impl PersistenceBlockers {
    /// No open regions and no runtime transaction
    pub fn can_persist(&self) -> bool {
        !self.no_persist.is_blocked() && self.runtime_transaction.is_none()
    }

    /// Err with the current blockers unless persistence is allowed
    pub fn check(&self) -> PersistenceResult<()> {
        if self.can_persist() {
            Ok(())
        } else {
            Err(PersistenceError::Blocked {
                no_persist_count: self.no_persist.count(),
                runtime_transaction: self.runtime_transaction.is_some(),
            })
        }
    }

    /// Gate count
    pub fn no_persist_count(&self) -> u32 {
        self.no_persist.count()
    }

    /// Active runtime transaction, if any
    pub fn runtime_transaction(&self) -> Option<&RuntimeTransactionData> {
        self.runtime_transaction.as_ref()
    }
}

/// Entries opened from one instance
#[derive(Debug, Default)]
pub struct NoPersistProperty {
    entries: Mutex<u32>,
}

impl NoPersistProperty {
    /// Enter on behalf of the owning instance
    pub fn enter(&self, gate: &mut NoPersistGate) {
        gate.enter();
        *self.entries.lock() += 1;
    }

    /// Exit on behalf of the owning instance
    pub fn exit(&self, gate: &mut NoPersistGate) -> ContractResult<bool> {
        let mut entries = self.entries.lock();
        if *entries == 0 {
            return Err(ContractError::NoPersistUnderflow);
        }
        let unblocked = gate.exit()?;
        *entries -= 1;
        Ok(unblocked)
    }

    /// Entries not yet exited
    pub fn outstanding(&self) -> u32 {
        *self.entries.lock()
    }
}

impl ExecutionProperty for NoPersistProperty {
    fn on_unregister(&self, ctx: &mut RegistrationContext<'_>) -> ContractResult<()> {
        let outstanding = std::mem::take(&mut *self.entries.lock());
        if outstanding > 0 {
            tracing::warn!(
                instance = %ctx.instance(),
                outstanding,
                "closing no-persist entries left open at scope teardown"
            );
        }
        for _ in 0..outstanding {
            ctx.no_persist().exit()?;
        }
        Ok(())
    }
}

/// Handle through which activity code opens no-persist regions
#[derive(Debug, Default)]
pub struct NoPersistHandle {
    state: HandleState,
}

impl NoPersistHandle {
    /// Open a region at the owning instance
    pub fn enter(&self, ctx: &mut HandleContext<'_>) -> ContractResult<()> {
        self.check_owner(ctx)?;
        let property = self.property(ctx)?;
        property.enter(ctx.no_persist());
        Ok(())
    }

    /// Close a region; true when persistence becomes possible again
    pub fn exit(&self, ctx: &mut HandleContext<'_>) -> ContractResult<bool> {
        self.check_owner(ctx)?;
        let property = self.property(ctx)?;
        property.exit(ctx.no_persist())
    }

    fn check_owner(&self, ctx: &HandleContext<'_>) -> ContractResult<()> {
        let owner = self.state.ensure_initialized(Self::TYPE_NAME)?;
        if owner != ctx.owner() {
            return Err(ContractError::HandleOwnerMismatch {
                handle: Self::TYPE_NAME.to_string(),
                owner,
                caller: ctx.owner(),
            });
        }
        Ok(())
    }

    fn property(&self, ctx: &mut HandleContext<'_>) -> ContractResult<Arc<NoPersistProperty>> {
        if let Some(existing) = ctx.find_property_at_current_scope(NO_PERSIST_PROPERTY)? {
            if let Some(property) = properties::downcast::<NoPersistProperty>(existing) {
                return Ok(property);
            }
            return Err(ContractError::DuplicateProperty(NO_PERSIST_PROPERTY.to_string()));
        }
        let property = Arc::new(NoPersistProperty::default());
        ctx.add_property(
            NO_PERSIST_PROPERTY,
            Arc::clone(&property) as Arc<dyn ExecutionProperty>,
            PropertyOptions::runtime(false),
        )?;
        Ok(property)
    }
}

impl Handle for NoPersistHandle {
    fn state(&self) -> &HandleState {
        &self.state
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn persisted_data(&self) -> Value {
        Value::Null
    }
}

impl HandleType for NoPersistHandle {
    const TYPE_NAME: &'static str = "NoPersistHandle";

    fn create() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_pairs_enters_and_exits() {
        let mut gate = NoPersistGate::default();
        gate.enter();
        gate.enter();
        assert!(gate.is_blocked());
        assert_eq!(gate.exit(), Ok(false));
        assert!(gate.is_blocked());
        assert_eq!(gate.exit(), Ok(true));
        assert!(!gate.is_blocked());
        assert_eq!(gate.exit(), Err(ContractError::NoPersistUnderflow));
    }

    #[test]
    fn test_blockers_report_count() {
        let mut blockers = PersistenceBlockers::default();
        assert!(blockers.check().is_ok());
        blockers.no_persist.enter();
        match blockers.check() {
            Err(PersistenceError::Blocked {
                no_persist_count,
                runtime_transaction,
            }) => {
                assert_eq!(no_persist_count, 1);
                assert!(!runtime_transaction);
            }
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_property_rejects_exit_without_own_enter() {
        let mut gate = NoPersistGate::default();
        gate.enter();
        let property = NoPersistProperty::default();
        assert_eq!(property.exit(&mut gate), Err(ContractError::NoPersistUnderflow));
        assert_eq!(gate.count(), 1);
    }

    #[test]
    fn test_unregister_compensates_outstanding_entries() {
        let mut blockers = PersistenceBlockers::default();
        let property = NoPersistProperty::default();
        for _ in 0..3 {
            property.enter(&mut blockers.no_persist);
        }
        blockers.no_persist.enter();

        let instance = crate::runtime::instance::InstanceId {
            index: 0,
            generation: 0,
        };
        property
            .on_unregister(&mut RegistrationContext::new(instance, &mut blockers))
            .unwrap();

        assert_eq!(property.outstanding(), 0);
        assert_eq!(blockers.no_persist_count(), 1);
    }
}
