use kvmap_model::{CollectionError, ModelError};
use kvmap_types::TypeError;

/// Errors from persistence operations.
///
/// Not-found is never an error: lookups return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No entity is registered for the requested type.
    #[error("type {name} is not a persistent entity")]
    NonPersistentType { name: String },

    /// The backend supplies no indexer for a collection association.
    #[error("backend has no association indexer for {entity}.{property}")]
    MissingAssociationIndexer { entity: String, property: String },

    /// The backend supplies no indexer for a property-value lookup.
    #[error("backend has no property indexer for {entity}.{property}")]
    MissingPropertyIndexer { entity: String, property: String },

    /// A non-nullable to-one association holds no object.
    #[error("non-nullable association {entity}.{property} is null")]
    NullAssociation { entity: String, property: String },

    /// An identifier cannot be turned into a native key.
    #[error("invalid key {key} for family {family}")]
    InvalidKey { family: String, key: String },

    /// A cascade reached an unsaved object whose own persist is in progress.
    #[error("circular cascade reached unsaved {entity}")]
    CircularCascade { entity: String },

    /// An interceptor refused the insert.
    #[error("insert of {entity} vetoed by interceptor")]
    PersistVetoed { entity: String },

    #[error("session is closed")]
    SessionClosed,

    #[error("no transaction in progress")]
    NoTransaction,

    /// Invalid datastore configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure raised by a backend hook, passed through unmodified.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl EngineError {
    /// Wrap an error raised by a backend.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    /// `true` for errors that point at a wiring defect rather than data.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            Self::NonPersistentType { .. }
            | Self::MissingAssociationIndexer { .. }
            | Self::MissingPropertyIndexer { .. }
            | Self::NullAssociation { .. }
            | Self::Config(_) => true,
            Self::Model(e) => !matches!(
                e,
                ModelError::Type(_)
                    | ModelError::Access { .. }
                    | ModelError::Collection(_)
                    | ModelError::LockPoisoned(_)
            ),
            _ => false,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(EngineError::NonPersistentType { name: "x".into() }.is_configuration_error());
        assert!(EngineError::from(ModelError::MissingIdentity { entity: "x".into() })
            .is_configuration_error());
        assert!(!EngineError::SessionClosed.is_configuration_error());
        assert!(!EngineError::from(ModelError::LockPoisoned("x".into())).is_configuration_error());
    }

    #[test]
    fn backend_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = EngineError::backend(io);
        assert_eq!(err.to_string(), "backend error: disk on fire");
        assert!(std::error::Error::source(&err).is_some());
    }
}
