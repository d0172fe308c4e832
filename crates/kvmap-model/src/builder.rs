//! Fluent construction of entity declarations.
//!
//! ```
//! use kvmap_model::{CascadePolicy, EntityBuilder, PropertyBuilder};
//! use kvmap_types::ValueType;
//!
//! let author = EntityBuilder::new("shop.Author")
//!     .family("authors")
//!     .identity(PropertyBuilder::identity("id", ValueType::Int))
//!     .property(PropertyBuilder::simple("name", ValueType::Text).indexed())
//!     .property(PropertyBuilder::one_to_many("books", "shop.Book").cascade(CascadePolicy::ALL))
//!     .build()
//!     .unwrap();
//! assert_eq!(author.properties.len(), 2);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use kvmap_types::ValueType;

use crate::collection::CollectionKind;
use crate::error::{ModelError, ModelResult};
use crate::mapping::FamilyMapping;
use crate::object::{InstanceFactory, ObjectRef};
use crate::property::{
    Association, CascadePolicy, CollectionAssociation, EmbeddedType, FetchStrategy,
    IdentityMapping, Property, PropertyKind, ToOne,
};

/// A validated, not yet initialized description of one entity.
#[derive(Clone)]
pub struct EntityDeclaration {
    pub name: String,
    pub mapped_form: FamilyMapping,
    pub identity: Property,
    pub properties: Vec<Property>,
    pub factory: Option<InstanceFactory>,
}

impl fmt::Debug for EntityDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDeclaration")
            .field("name", &self.name)
            .field("mapped_form", &self.mapped_form)
            .field("identity", &self.identity)
            .field("properties", &self.properties)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

/// Builds one [`Property`].
#[derive(Clone, Debug)]
pub struct PropertyBuilder {
    property: Property,
}

impl PropertyBuilder {
    pub fn identity(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::of(
            name,
            PropertyKind::Identity(IdentityMapping {
                value_type,
                generator: None,
            }),
        )
    }

    pub fn simple(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::of(name, PropertyKind::Simple(value_type))
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::of(
            name,
            PropertyKind::ToOne(ToOne {
                association: Association::new(target),
                foreign_key_in_child: false,
            }),
        )
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::of(name, PropertyKind::OneToMany(Self::collection_of(target)))
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::of(name, PropertyKind::ManyToMany(Self::collection_of(target)))
    }

    pub fn embedded(
        name: impl Into<String>,
        type_name: impl Into<String>,
        properties: impl IntoIterator<Item = PropertyBuilder>,
    ) -> Self {
        Self::of(
            name,
            PropertyKind::Embedded(EmbeddedType {
                type_name: type_name.into(),
                properties: properties.into_iter().map(Self::build).collect(),
                factory: None,
            }),
        )
    }

    fn of(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            property: Property::new(name, kind),
        }
    }

    fn collection_of(target: impl Into<String>) -> CollectionAssociation {
        CollectionAssociation {
            association: Association::new(target),
            fetch: None,
            collection: CollectionKind::List,
        }
    }

    fn association_mut(&mut self) -> Option<&mut Association> {
        match &mut self.property.kind {
            PropertyKind::ToOne(t) => Some(&mut t.association),
            PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => Some(&mut c.association),
            _ => None,
        }
    }

    fn collection_mut(&mut self) -> Option<&mut CollectionAssociation> {
        match &mut self.property.kind {
            PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => Some(c),
            _ => None,
        }
    }

    /// Record key, if it differs from the property name.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.property.mapping.key = Some(key.into());
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.property.mapping.nullable = nullable;
        self
    }

    /// Maintain a property-value index for this property.
    pub fn indexed(mut self) -> Self {
        self.property.mapping.index = true;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.property.mapping.attributes.insert(key.into(), value.into());
        self
    }

    /// Ignored on non-association properties.
    pub fn cascade(mut self, cascade: CascadePolicy) -> Self {
        if let Some(assoc) = self.association_mut() {
            assoc.cascade = cascade;
        }
        self
    }

    /// Mark this as the inverse side of `owner_property` on the target entity.
    pub fn mapped_by(mut self, owner_property: impl Into<String>) -> Self {
        if let Some(assoc) = self.association_mut() {
            assoc.mapped_by = Some(owner_property.into());
        }
        self
    }

    pub fn fetch(mut self, fetch: FetchStrategy) -> Self {
        if let Some(c) = self.collection_mut() {
            c.fetch = Some(fetch);
        }
        self
    }

    /// Hold the collection as a [`PersistentSet`](crate::PersistentSet).
    pub fn as_set(mut self) -> Self {
        if let Some(c) = self.collection_mut() {
            c.collection = CollectionKind::Set;
        }
        self
    }

    pub fn foreign_key_in_child(mut self) -> Self {
        if let PropertyKind::ToOne(t) = &mut self.property.kind {
            t.foreign_key_in_child = true;
        }
        self
    }

    pub fn generator(mut self, generator: impl Into<String>) -> Self {
        if let PropertyKind::Identity(id) = &mut self.property.kind {
            id.generator = Some(generator.into());
        }
        self
    }

    /// Factory used to rebuild an embedded value on retrieve.
    pub fn embedded_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> ObjectRef + Send + Sync + 'static,
    {
        if let PropertyKind::Embedded(e) = &mut self.property.kind {
            e.factory = Some(Arc::new(factory));
        }
        self
    }

    pub fn build(self) -> Property {
        self.property
    }
}

/// Builds an [`EntityDeclaration`].
pub struct EntityBuilder {
    name: String,
    mapped_form: FamilyMapping,
    identity: Option<Property>,
    properties: Vec<Property>,
    factory: Option<InstanceFactory>,
}

impl EntityBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mapped_form: FamilyMapping::default(),
            identity: None,
            properties: Vec::new(),
            factory: None,
        }
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.mapped_form.family = Some(family.into());
        self
    }

    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.mapped_form.keyspace = Some(keyspace.into());
        self
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> ObjectRef + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn identity(mut self, identity: PropertyBuilder) -> Self {
        self.identity = Some(identity.build());
        self
    }

    pub fn property(mut self, property: PropertyBuilder) -> Self {
        self.properties.push(property.build());
        self
    }

    /// Validate and produce the declaration.
    ///
    /// Fails with `MissingIdentity` if no identity property was given and
    /// with `DuplicateProperty` if a name (identity included) repeats.
    pub fn build(self) -> ModelResult<EntityDeclaration> {
        let identity = match self.identity {
            Some(p) if p.is_identity() => p,
            _ => {
                return Err(ModelError::MissingIdentity {
                    entity: self.name,
                })
            }
        };

        let mut seen = HashSet::new();
        seen.insert(identity.name.clone());
        for p in &self.properties {
            if p.is_identity() || !seen.insert(p.name.clone()) {
                return Err(ModelError::DuplicateProperty {
                    entity: self.name,
                    property: p.name.clone(),
                });
            }
        }

        Ok(EntityDeclaration {
            name: self.name,
            mapped_form: self.mapped_form,
            identity,
            properties: self.properties,
            factory: self.factory,
        })
    }
}
