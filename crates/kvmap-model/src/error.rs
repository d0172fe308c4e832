//! Error types for the metamodel, entity access, and lazy collections.

use kvmap_types::TypeError;
use thiserror::Error;

/// Errors raised while building or reading the metamodel.
///
/// Apart from `Type`, `Access`, and `Collection`, every variant is a
/// configuration error: it points at a wiring defect, not at missing data.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown persistent entity: {name}")]
    UnknownEntity { name: String },

    #[error("type {name} has no mapping declaration")]
    NotDeclared { name: String },

    #[error("entity {entity} has no identity property")]
    MissingIdentity { entity: String },

    #[error("entity {entity} declares property {property} more than once")]
    DuplicateProperty { entity: String, property: String },

    #[error("entity {entity} has no property named {property}")]
    UnknownProperty { entity: String, property: String },

    #[error("association {entity}.{property} targets {target}, which is not a persistent entity")]
    UnknownAssociationTarget {
        entity: String,
        property: String,
        target: String,
    },

    #[error("association {entity}.{property} is mapped by {mapped_by}, which {target} does not declare")]
    UnknownInverse {
        entity: String,
        property: String,
        target: String,
        mapped_by: String,
    },

    #[error("property {entity}.{property} is not an association")]
    NotAnAssociation { entity: String, property: String },

    #[error("entity {entity} has no instance factory")]
    NoInstanceFactory { entity: String },

    #[error("property {entity}.{property} holds an unexpected value (expected {expected})")]
    UnexpectedValue {
        entity: String,
        property: String,
        expected: &'static str,
    },

    #[error("access error on {entity}: {source}")]
    Access {
        entity: String,
        #[source]
        source: AccessError,
    },

    #[error("conversion error: {0}")]
    Type(#[from] TypeError),

    #[error("collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Errors a domain type reports from its [`Persistent`](crate::Persistent)
/// implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("no such property: {property}")]
    UnknownProperty { property: String },

    #[error("property {property} expects {expected}")]
    UnexpectedValue {
        property: String,
        expected: &'static str,
    },
}

impl AccessError {
    pub fn unknown(property: &str) -> Self {
        Self::UnknownProperty {
            property: property.to_string(),
        }
    }

    pub fn unexpected(property: &str, expected: &'static str) -> Self {
        Self::UnexpectedValue {
            property: property.to_string(),
            expected,
        }
    }
}

/// Errors raised by lazy collection operations.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The loader failed; the collection stays uninitialized.
    #[error("failed to load collection: {0}")]
    Load(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The session the collection was loaded from is no longer available.
    #[error("collection is detached from its session")]
    Detached,

    /// The collection was accessed while its own initialization was running.
    #[error("collection initialization already in progress")]
    InitializationInProgress,

    #[error("index {index} out of bounds for collection of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl CollectionError {
    /// Wrap any loader error.
    pub fn load<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Load(Box::new(err))
    }
}

/// Convenience alias for metamodel results.
pub type ModelResult<T> = Result<T, ModelError>;

/// Convenience alias for collection results.
pub type CollectionResult<T> = Result<T, CollectionError>;
