//! Entity metamodel for kvmap.
//!
//! Describes how domain types map onto record-oriented stores, independent
//! of any particular backend. Metamodel values are built once (usually at
//! startup) through [`EntityBuilder`] and a [`MappingSyntaxStrategy`], then
//! registered in a [`MappingContext`] and treated as immutable.
//!
//! Domain types take part by implementing [`Persistent`], a get/set-by-name
//! capability; [`EntityAccess`] layers metamodel checks and type coercion
//! on top of it.
//!
//! # Key Types
//!
//! - [`MappingContext`] - Arena of registered [`Entity`] values
//! - [`Entity`] - One mapped domain type: identity, properties, mapped form
//! - [`Property`] / [`PropertyKind`] - A mapped attribute and its kind
//! - [`Association`] - Target, cascade policy, and inverse of an association
//! - [`EntityAccess`] - Checked, coercing property access over an instance
//! - [`PersistentList`] / [`PersistentSet`] - Lazily loaded association collections

pub mod access;
pub mod builder;
pub mod collection;
pub mod context;
pub mod entity;
pub mod error;
pub mod mapping;
pub mod object;
pub mod property;
pub mod syntax;

pub use access::EntityAccess;
pub use builder::{EntityBuilder, EntityDeclaration, PropertyBuilder};
pub use collection::{
    CollectionKind, CollectionLoader, CollectionState, PersistentCollection, PersistentList,
    PersistentSet,
};
pub use context::MappingContext;
pub use entity::Entity;
pub use error::{AccessError, CollectionError, CollectionResult, ModelError, ModelResult};
pub use mapping::{FamilyMapping, KeyValueMapping, KeyValueMappingFactory, MappingFactory};
pub use object::{
    object_address, object_ref, same_object, with_object, with_object_mut, InstanceFactory,
    ObjectRef, Persistent, PropertyValue,
};
pub use property::{
    Association, CascadePolicy, CollectionAssociation, EmbeddedType, FetchStrategy,
    IdentityMapping, Property, PropertyKind, ToOne,
};
pub use syntax::{DeclaredSyntaxStrategy, MappingSyntaxStrategy};
