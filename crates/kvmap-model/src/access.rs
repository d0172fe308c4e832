//! Metamodel-checked property access over a domain instance.

use kvmap_types::{ConversionService, Value};

use crate::collection::PersistentCollection;
use crate::entity::Entity;
use crate::error::{ModelError, ModelResult};
use crate::object::{ObjectRef, PropertyValue};

/// Binds an [`Entity`] to one instance of it.
///
/// Every property name is checked against the entity first; names the
/// entity does not declare fail with [`ModelError::UnknownProperty`] on both
/// get and set. Scalars written through `set_property` are coerced to the
/// declared type of the property with the conversion table.
///
/// Locks on the instance are held only for the duration of a single call.
pub struct EntityAccess<'a> {
    entity: &'a Entity,
    object: &'a ObjectRef,
    conversions: &'a ConversionService,
}

impl<'a> EntityAccess<'a> {
    pub fn new(
        entity: &'a Entity,
        object: &'a ObjectRef,
        conversions: &'a ConversionService,
    ) -> Self {
        Self {
            entity,
            object,
            conversions,
        }
    }

    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    pub fn object(&self) -> &'a ObjectRef {
        self.object
    }

    fn unknown(&self, property: &str) -> ModelError {
        ModelError::UnknownProperty {
            entity: self.entity.name().to_string(),
            property: property.to_string(),
        }
    }

    fn unexpected(&self, property: &str, expected: &'static str) -> ModelError {
        ModelError::UnexpectedValue {
            entity: self.entity.name().to_string(),
            property: property.to_string(),
            expected,
        }
    }

    pub fn get_property(&self, name: &str) -> ModelResult<PropertyValue> {
        self.entity.require_property(name)?;
        let guard = self
            .object
            .read()
            .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
        guard.get_property(name).ok_or_else(|| self.unknown(name))
    }

    pub fn get_scalar(&self, name: &str) -> ModelResult<Value> {
        self.get_property(name)?
            .into_scalar()
            .ok_or_else(|| self.unexpected(name, "scalar"))
    }

    pub fn get_object(&self, name: &str) -> ModelResult<Option<ObjectRef>> {
        self.get_property(name)?
            .into_object()
            .ok_or_else(|| self.unexpected(name, "object"))
    }

    pub fn get_collection(&self, name: &str) -> ModelResult<Option<PersistentCollection>> {
        self.get_property(name)?
            .into_collection()
            .ok_or_else(|| self.unexpected(name, "collection"))
    }

    pub fn set_property(&self, name: &str, value: PropertyValue) -> ModelResult<()> {
        let property = self.entity.require_property(name)?;
        let value = match value {
            PropertyValue::Scalar(v) => {
                PropertyValue::Scalar(self.conversions.convert_owned(v, property.value_type())?)
            }
            other => other,
        };
        let mut guard = self
            .object
            .write()
            .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
        guard
            .set_property(name, value)
            .map_err(|source| ModelError::Access {
                entity: self.entity.name().to_string(),
                source,
            })
    }

    pub fn set_scalar(&self, name: &str, value: Value) -> ModelResult<()> {
        self.set_property(name, PropertyValue::Scalar(value))
    }

    pub fn identifier_name(&self) -> ModelResult<&'a str> {
        self.entity.identity_name()
    }

    /// Current identifier; `None` while the instance is unsaved.
    pub fn identifier(&self) -> ModelResult<Option<Value>> {
        let name = self.identifier_name()?;
        Ok(self.get_scalar(name)?.non_null())
    }

    /// Write the identifier, coerced to the identity property's type.
    pub fn set_identifier(&self, value: Value) -> ModelResult<()> {
        let name = self.identifier_name()?;
        self.set_scalar(name, value)
    }
}
