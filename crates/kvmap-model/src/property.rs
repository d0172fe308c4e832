//! Persistent properties and the closed set of property kinds.
//!
//! A [`Property`] pairs a name with a [`PropertyKind`] and the
//! [`KeyValueMapping`] that says where it lives in a native record. The
//! persister switches over `PropertyKind` exhaustively; there is no other
//! way to ask "what sort of property is this".

use std::fmt;

use kvmap_types::ValueType;
use serde::{Deserialize, Serialize};

use crate::collection::CollectionKind;
use crate::mapping::KeyValueMapping;
use crate::object::InstanceFactory;

/// When the elements of a collection association are loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Load the children together with the owner.
    Eager,
    /// Load the children on first access to the collection.
    #[default]
    Lazy,
}

/// Which operations on the owner propagate to associated objects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CascadePolicy {
    pub save: bool,
    pub delete: bool,
}

impl CascadePolicy {
    pub const NONE: Self = Self {
        save: false,
        delete: false,
    };
    pub const SAVE: Self = Self {
        save: true,
        delete: false,
    };
    pub const ALL: Self = Self {
        save: true,
        delete: true,
    };
}

/// Shared part of every association kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Association {
    /// Name of the associated entity.
    pub target: String,
    pub cascade: CascadePolicy,
    /// Set on the inverse side of a bidirectional association: the name of
    /// the property on `target` that owns the relationship.
    pub mapped_by: Option<String>,
}

impl Association {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            cascade: CascadePolicy::NONE,
            mapped_by: None,
        }
    }

    pub fn is_owning_side(&self) -> bool {
        self.mapped_by.is_none()
    }

    /// Saving the owner also saves the associated objects.
    pub fn cascades_save(&self) -> bool {
        self.is_owning_side() && self.cascade.save
    }

    /// Deleting the owner also deletes the associated objects.
    pub fn cascades_delete(&self) -> bool {
        self.is_owning_side() && self.cascade.delete
    }
}

/// Identity property metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityMapping {
    pub value_type: ValueType,
    /// Key generation strategy understood by the backend, e.g. `"increment"`.
    pub generator: Option<String>,
}

/// Single-valued association.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToOne {
    pub association: Association,
    /// The foreign key is stored on the associated record, not on the owner.
    pub foreign_key_in_child: bool,
}

/// Collection-valued association (`OneToMany` or `ManyToMany`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionAssociation {
    pub association: Association,
    /// `None` defers to the datastore default.
    pub fetch: Option<FetchStrategy>,
    pub collection: CollectionKind,
}

impl CollectionAssociation {
    pub fn fetch_or(&self, default: FetchStrategy) -> FetchStrategy {
        self.fetch.unwrap_or(default)
    }
}

/// Value composed inline into the owner's record.
#[derive(Clone)]
pub struct EmbeddedType {
    pub type_name: String,
    pub properties: Vec<Property>,
    pub factory: Option<InstanceFactory>,
}

impl EmbeddedType {
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

impl fmt::Debug for EmbeddedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedType")
            .field("type_name", &self.type_name)
            .field("properties", &self.properties)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

impl PartialEq for EmbeddedType {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.properties == other.properties
    }
}

/// The closed set of property kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyKind {
    Simple(ValueType),
    Identity(IdentityMapping),
    ToOne(ToOne),
    OneToMany(CollectionAssociation),
    ManyToMany(CollectionAssociation),
    Embedded(EmbeddedType),
}

/// One mapped attribute of an entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
    pub mapping: KeyValueMapping,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mapping: KeyValueMapping::default(),
        }
    }

    /// Key under which the property is stored in a native record.
    pub fn target_key(&self) -> &str {
        self.mapping.key.as_deref().unwrap_or(&self.name)
    }

    /// Declared scalar type; associations and embedded values report `Any`.
    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            PropertyKind::Simple(t) => *t,
            PropertyKind::Identity(id) => id.value_type,
            PropertyKind::Embedded(_) => ValueType::Map,
            _ => ValueType::Any,
        }
    }

    pub fn association(&self) -> Option<&Association> {
        match &self.kind {
            PropertyKind::ToOne(t) => Some(&t.association),
            PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => Some(&c.association),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&CollectionAssociation> {
        match &self.kind {
            PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, PropertyKind::Identity(_))
    }

    pub fn is_indexed(&self) -> bool {
        self.mapping.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_key_defaults_to_name() {
        let mut p = Property::new("title", PropertyKind::Simple(ValueType::Text));
        assert_eq!(p.target_key(), "title");
        p.mapping.key = Some("t".into());
        assert_eq!(p.target_key(), "t");
    }

    #[test]
    fn inverse_side_never_cascades() {
        let mut assoc = Association::new("test.Book");
        assoc.cascade = CascadePolicy::ALL;
        assert!(assoc.cascades_save());
        assoc.mapped_by = Some("author".into());
        assert!(!assoc.is_owning_side());
        assert!(!assoc.cascades_save());
        assert!(!assoc.cascades_delete());
    }

    #[test]
    fn collection_fetch_falls_back_to_default() {
        let c = CollectionAssociation {
            association: Association::new("test.Book"),
            fetch: None,
            collection: CollectionKind::List,
        };
        assert_eq!(c.fetch_or(FetchStrategy::Eager), FetchStrategy::Eager);
        let p = Property::new("books", PropertyKind::OneToMany(c));
        assert_eq!(p.value_type(), ValueType::Any);
        assert_eq!(p.association().map(|a| a.target.as_str()), Some("test.Book"));
        assert!(p.collection().is_some());
    }

    #[test]
    fn fetch_strategy_serializes_lowercase() {
        let json = serde_json::to_string(&FetchStrategy::Eager).unwrap();
        assert_eq!(json, "\"eager\"");
        assert_eq!(FetchStrategy::default(), FetchStrategy::Lazy);
    }
}
