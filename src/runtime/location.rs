//! Declared locations and per-instance environments
//!
//! A [`LocationReference`] is the definition-side declaration of a
//! variable, argument or delegate argument. Its [`LocationId`] is assigned
//! when the declaring activity's metadata is cached and never changes
//! afterwards. At runtime every instance owns an [`Environment`] holding one
//! JSON value per location its activity declares; lookups walk the instance
//! chain from the requesting instance towards the root.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use super::activity::{Activity, DefinitionId};
use super::error::{ContractError, ContractResult};
use super::flags::VariableModifiers;
use super::instance::{InstanceId, InstanceTree};

/// Data flow direction of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgumentDirection {
    /// Bound by the scheduling parent
    In,
    /// Reported back to the parent on completion
    Out,
    /// Both
    InOut,
}

/// What kind of declaration a location is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationKind {
    /// Variable, visible to descendants
    Variable,
    /// Argument, visible only to the declaring activity
    Argument(ArgumentDirection),
    /// Delegate argument, visible to descendants
    DelegateArgument,
}

impl LocationKind {
    /// Whether descendants may resolve this location
    pub fn visible_to_descendants(self) -> bool {
        !matches!(self, LocationKind::Argument(_))
    }

    /// Whether the scheduling parent may bind a value
    pub fn accepts_binding(self) -> bool {
        matches!(
            self,
            LocationKind::Argument(ArgumentDirection::In | ArgumentDirection::InOut)
        )
    }

    /// Whether the value is reported on completion
    pub fn is_output(self) -> bool {
        matches!(
            self,
            LocationKind::Argument(ArgumentDirection::Out | ArgumentDirection::InOut)
        )
    }

    fn tag(self) -> &'static str {
        match self {
            LocationKind::Variable => "var",
            LocationKind::Argument(ArgumentDirection::In) => "in",
            LocationKind::Argument(ArgumentDirection::Out) => "out",
            LocationKind::Argument(ArgumentDirection::InOut) => "inout",
            LocationKind::DelegateArgument => "delegate",
        }
    }
}

/// Identity of a declared location: declaring activity plus declaration index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationId {
    /// Declaring activity
    pub owner: DefinitionId,
    /// Position in the declaring activity's location list
    pub index: u32,
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.index)
    }
}

/// A named, typed storage declaration
#[derive(Debug)]
pub struct LocationReference {
    name: String,
    type_name: &'static str,
    kind: LocationKind,
    modifiers: VariableModifiers,
    default: Option<Value>,
    id: OnceLock<LocationId>,
}

impl LocationReference {
    /// Declare a location
    pub fn new(name: impl Into<String>, type_name: &'static str, kind: LocationKind) -> Self {
        Self {
            name: name.into(),
            type_name,
            kind,
            modifiers: VariableModifiers::NONE,
            default: None,
            id: OnceLock::new(),
        }
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared Rust type name
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Declaration kind
    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    /// Modifiers
    pub fn modifiers(&self) -> VariableModifiers {
        self.modifiers
    }

    /// Initial value when nothing is bound
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Identity, once metadata has been cached
    pub fn id(&self) -> Option<LocationId> {
        self.id.get().copied()
    }

    /// Identity or an unresolved error
    pub fn require_id(&self) -> ContractResult<LocationId> {
        self.id()
            .ok_or_else(|| ContractError::LocationUnresolved(self.name.clone()))
    }

    pub(crate) fn bind_id(&self, id: LocationId) -> ContractResult<()> {
        let bound = self.id.get_or_init(|| id);
        if *bound == id {
            Ok(())
        } else {
            Err(ContractError::DuplicateDeclaration(self.name.clone()))
        }
    }

    pub(crate) fn fingerprint_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(self.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.type_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.kind.tag().as_bytes());
        hasher.update(&[self.modifiers.bits()]);
    }

    fn rebuild(&self, modifiers: VariableModifiers, default: Option<Value>) -> Self {
        Self {
            name: self.name.clone(),
            type_name: self.type_name,
            kind: self.kind,
            modifiers,
            default,
            id: OnceLock::new(),
        }
    }
}

/// Typed access to a declared location
pub trait TypedLocation<T> {
    /// Underlying declaration
    fn reference(&self) -> &Arc<LocationReference>;
}

/// A typed variable or delegate argument
pub struct Variable<T> {
    reference: Arc<LocationReference>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Variable<T> {
    /// Declare a variable
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_kind(name, LocationKind::Variable)
    }

    /// Declare a delegate argument
    pub fn delegate(name: impl Into<String>) -> Self {
        Self::with_kind(name, LocationKind::DelegateArgument)
    }

    fn with_kind(name: impl Into<String>, kind: LocationKind) -> Self {
        Self {
            reference: Arc::new(LocationReference::new(
                name,
                std::any::type_name::<T>(),
                kind,
            )),
            _marker: PhantomData,
        }
    }

    /// Reject writes from activity code
    pub fn read_only(self) -> Self {
        let modifiers = self.reference.modifiers | VariableModifiers::READ_ONLY;
        let default = self.reference.default.clone();
        self.rebuilt(modifiers, default)
    }

    /// Expose to the host as a mapped variable
    pub fn mapped(self) -> Self {
        let modifiers = self.reference.modifiers | VariableModifiers::MAPPED;
        let default = self.reference.default.clone();
        self.rebuilt(modifiers, default)
    }

    /// Initial value
    pub fn with_default(self, value: T) -> Self
    where
        T: Serialize,
    {
        let modifiers = self.reference.modifiers;
        let default = serde_json::to_value(value).ok();
        self.rebuilt(modifiers, default)
    }

    fn rebuilt(&self, modifiers: VariableModifiers, default: Option<Value>) -> Self {
        Self {
            reference: Arc::new(self.reference.rebuild(modifiers, default)),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
            _marker: PhantomData,
        }
    }
}

impl<T> TypedLocation<T> for Variable<T> {
    fn reference(&self) -> &Arc<LocationReference> {
        &self.reference
    }
}

/// A typed argument
pub struct Argument<T> {
    reference: Arc<LocationReference>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Argument<T> {
    fn with_direction(name: impl Into<String>, direction: ArgumentDirection) -> Self {
        Self {
            reference: Arc::new(LocationReference::new(
                name,
                std::any::type_name::<T>(),
                LocationKind::Argument(direction),
            )),
            _marker: PhantomData,
        }
    }

    /// Input argument
    pub fn input(name: impl Into<String>) -> Self {
        Self::with_direction(name, ArgumentDirection::In)
    }

    /// Output argument
    pub fn output(name: impl Into<String>) -> Self {
        Self::with_direction(name, ArgumentDirection::Out)
    }

    /// In/out argument
    pub fn in_out(name: impl Into<String>) -> Self {
        Self::with_direction(name, ArgumentDirection::InOut)
    }
}

impl<T> Clone for Argument<T> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
            _marker: PhantomData,
        }
    }
}

impl<T> TypedLocation<T> for Argument<T> {
    fn reference(&self) -> &Arc<LocationReference> {
        &self.reference
    }
}

/// Runtime storage for the locations one activity declares
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    values: Vec<Value>,
}

impl Environment {
    /// Build the environment for a new instance of `activity`.
    ///
    /// Bindings may only target In/InOut arguments; unknown names fail.
    pub fn for_activity(activity: &Activity, bindings: &[(String, Value)]) -> ContractResult<Self> {
        for (name, _) in bindings {
            let bindable = activity
                .locations()
                .iter()
                .any(|loc| loc.name() == name && loc.kind().accepts_binding());
            if !bindable {
                return Err(ContractError::LocationNotFound(name.clone()));
            }
        }

        let values = activity
            .locations()
            .iter()
            .map(|loc| {
                bindings
                    .iter()
                    .rev()
                    .find(|(name, _)| name == loc.name() && loc.kind().accepts_binding())
                    .map(|(_, value)| value.clone())
                    .or_else(|| loc.default_value().cloned())
                    .unwrap_or(Value::Null)
            })
            .collect();

        Ok(Self { values })
    }

    /// Restore raw slot values
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Raw slot values
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value at a declaration index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub(crate) fn set(&mut self, index: usize, value: Value) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Values of Out/InOut arguments, keyed by name
    pub fn outputs(&self, activity: &Activity) -> BTreeMap<String, Value> {
        activity
            .locations()
            .iter()
            .zip(&self.values)
            .filter(|(loc, _)| loc.kind().is_output())
            .map(|(loc, value)| (loc.name().to_string(), value.clone()))
            .collect()
    }
}

/// A resolved storage slot
#[derive(Debug, Clone)]
pub struct ResolvedLocation {
    /// Instance whose environment holds the value
    pub instance: InstanceId,
    /// Declaration index
    pub index: usize,
    /// The declaration
    pub reference: Arc<LocationReference>,
}

/// Resolve a declared location from `start`.
///
/// With `inherited`, the search begins at the parent of `start`.
pub(crate) fn resolve(
    tree: &InstanceTree,
    start: InstanceId,
    reference: &LocationReference,
    inherited: bool,
) -> ContractResult<ResolvedLocation> {
    let id = reference.require_id()?;
    let first = if inherited {
        tree.parent_of(start)?
    } else {
        Some(start)
    };

    let mut cursor = first;
    while let Some(current) = cursor {
        let instance = tree.get(current)?;
        if instance.activity().id() == Some(id.owner) {
            if current != start && !reference.kind().visible_to_descendants() {
                break;
            }
            let index = id.index as usize;
            let declared = instance
                .activity()
                .locations()
                .get(index)
                .cloned()
                .ok_or_else(|| ContractError::LocationNotFound(reference.name().to_string()))?;
            return Ok(ResolvedLocation {
                instance: current,
                index,
                reference: declared,
            });
        }
        cursor = instance.parent();
    }

    Err(ContractError::LocationNotFound(reference.name().to_string()))
}

/// Resolve a location by declared name.
///
/// The starting instance sees all of its own declarations; ancestors only
/// expose variables and delegate arguments.
pub(crate) fn resolve_by_name(
    tree: &InstanceTree,
    start: InstanceId,
    name: &str,
    inherited: bool,
) -> ContractResult<ResolvedLocation> {
    let first = if inherited {
        tree.parent_of(start)?
    } else {
        Some(start)
    };

    let mut cursor = first;
    while let Some(current) = cursor {
        let instance = tree.get(current)?;
        let found = instance
            .activity()
            .locations()
            .iter()
            .enumerate()
            .find(|(_, loc)| {
                loc.name() == name && (current == start || loc.kind().visible_to_descendants())
            });
        if let Some((index, reference)) = found {
            return Ok(ResolvedLocation {
                instance: current,
                index,
                reference: Arc::clone(reference),
            });
        }
        cursor = instance.parent();
    }

    Err(ContractError::LocationNotFound(name.to_string()))
}

/// Deserialize a stored value into the declared type
pub(crate) fn decode<T: DeserializeOwned>(reference: &LocationReference, value: &Value) -> ContractResult<T> {
    serde_json::from_value(value.clone()).map_err(|err| ContractError::TypeMismatch {
        name: reference.name().to_string(),
        expected: reference.type_name().to_string(),
        detail: err.to_string(),
    })
}

/// Serialize a value for storage, rejecting read-only targets
pub(crate) fn encode<T: Serialize>(reference: &LocationReference, value: T) -> ContractResult<Value> {
    if reference.modifiers().is_read_only() {
        return Err(ContractError::ReadOnlyLocation(reference.name().to_string()));
    }
    serde_json::to_value(value).map_err(|err| ContractError::TypeMismatch {
        name: reference.name().to_string(),
        expected: reference.type_name().to_string(),
        detail: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variable_builders_keep_name_and_type() {
        let v = Variable::<i64>::new("count").with_default(3).read_only().mapped();
        let r = v.reference();
        assert_eq!(r.name(), "count");
        assert_eq!(r.type_name(), "i64");
        assert!(r.modifiers().is_read_only());
        assert!(r.modifiers().is_mapped());
        assert_eq!(r.default_value(), Some(&json!(3)));
        assert!(r.id().is_none());
    }

    #[test]
    fn test_bind_id_is_stable() {
        let r = LocationReference::new("x", "i64", LocationKind::Variable);
        let id = LocationId {
            owner: DefinitionId(1),
            index: 0,
        };
        r.bind_id(id).unwrap();
        r.bind_id(id).unwrap();
        let other = LocationId {
            owner: DefinitionId(2),
            index: 0,
        };
        assert_eq!(
            r.bind_id(other),
            Err(ContractError::DuplicateDeclaration("x".into()))
        );
        assert_eq!(r.id(), Some(id));
    }

    #[test]
    fn test_argument_visibility_rules() {
        assert!(!LocationKind::Argument(ArgumentDirection::In).visible_to_descendants());
        assert!(LocationKind::Variable.visible_to_descendants());
        assert!(LocationKind::DelegateArgument.visible_to_descendants());
        assert!(LocationKind::Argument(ArgumentDirection::InOut).accepts_binding());
        assert!(!LocationKind::Argument(ArgumentDirection::Out).accepts_binding());
    }

    #[test]
    fn test_encode_rejects_read_only() {
        let v = Variable::<String>::new("name").read_only();
        let err = encode(v.reference(), "x").unwrap_err();
        assert_eq!(err, ContractError::ReadOnlyLocation("name".into()));
    }

    #[test]
    fn test_decode_reports_type_mismatch() {
        let v = Variable::<i64>::new("n");
        let err = decode::<i64>(v.reference(), &json!("not a number")).unwrap_err();
        assert!(matches!(err, ContractError::TypeMismatch { ref name, .. } if name == "n"));
    }
}
