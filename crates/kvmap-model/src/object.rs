//! The capability interface domain types implement to become persistable.
//!
//! kvmap never reflects over domain types. Instead each type implements
//! [`Persistent`]: a get/set-by-name facade written by hand or generated.
//! Instances are shared as [`ObjectRef`] handles so that a parent, its
//! children, and the session identity map all observe the same instance.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock};

use kvmap_types::Value;

use crate::collection::{PersistentCollection, PersistentList, PersistentSet};
use crate::error::AccessError;

/// Get/set-by-name access to one domain instance.
///
/// `get_property` returns `None` for names the type does not have.
/// `set_property` receives values already coerced to the declared type of
/// the property, so implementations only need to unwrap the expected variant.
pub trait Persistent: Any + Send + Sync {
    /// Fully qualified name of the entity this instance belongs to.
    fn entity_name(&self) -> &str;

    fn get_property(&self, name: &str) -> Option<PropertyValue>;

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to a domain instance.
pub type ObjectRef = Arc<RwLock<dyn Persistent>>;

/// Allocates a fresh, empty instance of a mapped type.
pub type InstanceFactory = Arc<dyn Fn() -> ObjectRef + Send + Sync>;

/// Wrap a domain value into a shared [`ObjectRef`].
pub fn object_ref<T: Persistent>(value: T) -> ObjectRef {
    Arc::new(RwLock::new(value))
}

/// Identity comparison: `true` if both handles point at the same instance.
pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Stable address of the instance, usable as a map key while it is alive.
pub fn object_address(object: &ObjectRef) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

/// Run `f` against the concrete type behind `object`.
///
/// Returns `None` if the lock is poisoned or the instance is not a `T`.
pub fn with_object<T: Persistent, R>(object: &ObjectRef, f: impl FnOnce(&T) -> R) -> Option<R> {
    let guard = object.read().ok()?;
    guard.as_any().downcast_ref::<T>().map(f)
}

/// Mutable counterpart of [`with_object`].
pub fn with_object_mut<T: Persistent, R>(
    object: &ObjectRef,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    let mut guard = object.write().ok()?;
    guard.as_any_mut().downcast_mut::<T>().map(f)
}

/// A property value as seen through [`Persistent`].
#[derive(Clone)]
pub enum PropertyValue {
    /// Simple or identity value.
    Scalar(Value),
    /// To-one association or embedded value.
    Object(Option<ObjectRef>),
    /// To-many association.
    Collection(PersistentCollection),
}

impl PropertyValue {
    pub const fn null() -> Self {
        Self::Scalar(Value::Null)
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced object. A scalar `Null` is read as "no object".
    pub fn into_object(self) -> Option<Option<ObjectRef>> {
        match self {
            Self::Object(o) => Some(o),
            Self::Scalar(Value::Null) => Some(None),
            _ => None,
        }
    }

    /// The collection. A scalar `Null` is read as "no collection".
    pub fn into_collection(self) -> Option<Option<PersistentCollection>> {
        match self {
            Self::Collection(c) => Some(Some(c)),
            Self::Scalar(Value::Null) => Some(None),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<PersistentList> {
        match self {
            Self::Collection(PersistentCollection::List(list)) => Some(list),
            _ => None,
        }
    }

    pub fn into_set(self) -> Option<PersistentSet> {
        match self {
            Self::Collection(PersistentCollection::Set(set)) => Some(set),
            _ => None,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Object(None) => f.write_str("Object(None)"),
            Self::Object(Some(o)) => write!(f, "Object(@{:#x})", object_address(o)),
            Self::Collection(c) => f.debug_tuple("Collection").field(c).finish(),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<ObjectRef> for PropertyValue {
    fn from(o: ObjectRef) -> Self {
        Self::Object(Some(o))
    }
}

impl From<Option<ObjectRef>> for PropertyValue {
    fn from(o: Option<ObjectRef>) -> Self {
        Self::Object(o)
    }
}

impl From<PersistentCollection> for PropertyValue {
    fn from(c: PersistentCollection) -> Self {
        Self::Collection(c)
    }
}

impl From<PersistentList> for PropertyValue {
    fn from(l: PersistentList) -> Self {
        Self::Collection(PersistentCollection::List(l))
    }
}

impl From<PersistentSet> for PropertyValue {
    fn from(s: PersistentSet) -> Self {
        Self::Collection(PersistentCollection::Set(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tag {
        label: String,
    }

    impl Persistent for Tag {
        fn entity_name(&self) -> &str {
            "test.Tag"
        }

        fn get_property(&self, name: &str) -> Option<PropertyValue> {
            match name {
                "label" => Some(Value::from(self.label.as_str()).into()),
                _ => None,
            }
        }

        fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError> {
            match name {
                "label" => {
                    self.label = value
                        .into_scalar()
                        .and_then(Value::into_string)
                        .ok_or_else(|| AccessError::unexpected(name, "text"))?;
                    Ok(())
                }
                _ => Err(AccessError::unknown(name)),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn same_object_is_identity_not_equality() {
        let a = object_ref(Tag::default());
        let b = object_ref(Tag::default());
        let a2 = Arc::clone(&a);
        assert!(same_object(&a, &a2));
        assert!(!same_object(&a, &b));
        assert_eq!(object_address(&a), object_address(&a2));
    }

    #[test]
    fn downcast_helpers_reach_concrete_type() {
        let tag = object_ref(Tag::default());
        with_object_mut::<Tag, _>(&tag, |t| t.label = "rust".into()).unwrap();
        let label = with_object::<Tag, _>(&tag, |t| t.label.clone()).unwrap();
        assert_eq!(label, "rust");
    }

    #[test]
    fn null_scalar_reads_as_absent_object() {
        assert!(matches!(PropertyValue::null().into_object(), Some(None)));
        assert!(PropertyValue::Scalar(Value::Int(1)).into_object().is_none());
    }
}
