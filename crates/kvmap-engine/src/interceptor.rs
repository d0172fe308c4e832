use kvmap_model::{Entity, ObjectRef};

/// Hooks invoked by a [`Session`](crate::Session) before it writes.
///
/// Returning `false` vetoes the operation:
/// - `before_insert`: the persist fails with
///   [`EngineError::PersistVetoed`](crate::EngineError::PersistVetoed).
/// - `before_update`: the write is skipped and the existing identifier is returned.
/// - `before_delete`: the object is left out of the delete batch.
///
/// Interceptors may mutate the object; no locks are held while they run.
pub trait EntityInterceptor: Send + Sync {
    fn before_insert(&self, _entity: &Entity, _object: &ObjectRef) -> bool {
        true
    }

    fn before_update(&self, _entity: &Entity, _object: &ObjectRef) -> bool {
        true
    }

    fn before_delete(&self, _entity: &Entity, _object: &ObjectRef) -> bool {
        true
    }
}
