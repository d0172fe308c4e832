//! The persistent entity: metamodel of one mapped domain type.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{ModelError, ModelResult};
use crate::mapping::{FamilyMapping, MappingFactory};
use crate::object::{InstanceFactory, ObjectRef};
use crate::property::{Property, PropertyKind};
use crate::syntax::MappingSyntaxStrategy;

struct Initialized {
    mapped_form: FamilyMapping,
    identity: Property,
    properties: Vec<Property>,
    by_name: HashMap<String, usize>,
    factory: Option<InstanceFactory>,
}

/// One mapped domain type.
///
/// Construction is two-phase: [`Entity::new`] records the name, and
/// [`Entity::initialize`] reads properties and mapped form from a syntax
/// strategy. Initialization happens once; later calls are no-ops. Entities
/// obtained from a [`MappingContext`](crate::MappingContext) are always
/// initialized.
pub struct Entity {
    name: String,
    state: OnceLock<Initialized>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: OnceLock::new(),
        }
    }

    /// Populate properties and mapped form. Idempotent.
    pub fn initialize(
        &self,
        strategy: &dyn MappingSyntaxStrategy,
        factory: &dyn MappingFactory,
    ) -> ModelResult<()> {
        if self.state.get().is_some() {
            return Ok(());
        }

        let mut identity = strategy.identity(&self.name)?;
        if !identity.is_identity() {
            return Err(ModelError::MissingIdentity {
                entity: self.name.clone(),
            });
        }
        identity.mapping = factory.create_property_mapping(&self.name, &identity);

        let mut properties = strategy.persistent_properties(&self.name)?;
        let mut by_name = HashMap::with_capacity(properties.len());
        for (i, p) in properties.iter_mut().enumerate() {
            p.mapping = factory.create_property_mapping(&self.name, p);
            if let PropertyKind::Embedded(embedded) = &mut p.kind {
                for inner in embedded.properties.iter_mut() {
                    inner.mapping = factory.create_property_mapping(&embedded.type_name, inner);
                }
            }
            if p.name == identity.name || by_name.insert(p.name.clone(), i).is_some() {
                return Err(ModelError::DuplicateProperty {
                    entity: self.name.clone(),
                    property: p.name.clone(),
                });
            }
        }

        let mapped_form = factory.create_mapped_form(&self.name, &strategy.mapped_form(&self.name)?);
        debug!(
            entity = %self.name,
            family = ?mapped_form.family,
            properties = properties.len(),
            "initialized entity"
        );

        // A concurrent initializer may have won; either result is equivalent.
        let _ = self.state.set(Initialized {
            mapped_form,
            identity,
            properties,
            by_name,
            factory: strategy.instance_factory(&self.name),
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend family; defaults to the entity name.
    pub fn family(&self) -> &str {
        self.state
            .get()
            .and_then(|s| s.mapped_form.family.as_deref())
            .unwrap_or(&self.name)
    }

    pub fn mapped_form(&self) -> Option<&FamilyMapping> {
        self.state.get().map(|s| &s.mapped_form)
    }

    pub fn identity(&self) -> ModelResult<&Property> {
        self.state
            .get()
            .map(|s| &s.identity)
            .ok_or_else(|| ModelError::MissingIdentity {
                entity: self.name.clone(),
            })
    }

    pub fn identity_name(&self) -> ModelResult<&str> {
        Ok(&self.identity()?.name)
    }

    /// Non-identity properties in declaration order.
    pub fn persistent_properties(&self) -> &[Property] {
        self.state
            .get()
            .map(|s| s.properties.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a property by name; the identity property included.
    pub fn property(&self, name: &str) -> Option<&Property> {
        let state = self.state.get()?;
        if state.identity.name == name {
            return Some(&state.identity);
        }
        state.by_name.get(name).map(|&i| &state.properties[i])
    }

    /// Like [`property`](Self::property) but a missing name is an error.
    pub fn require_property(&self, name: &str) -> ModelResult<&Property> {
        self.property(name).ok_or_else(|| ModelError::UnknownProperty {
            entity: self.name.clone(),
            property: name.to_string(),
        })
    }

    /// Allocate an empty instance.
    pub fn new_instance(&self) -> ModelResult<ObjectRef> {
        self.state
            .get()
            .and_then(|s| s.factory.as_ref())
            .map(|f| f())
            .ok_or_else(|| ModelError::NoInstanceFactory {
                entity: self.name.clone(),
            })
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("family", &self.family())
            .field("initialized", &self.is_initialized())
            .field("properties", &self.persistent_properties().len())
            .finish()
    }
}
