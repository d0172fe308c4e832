//! The hooks a backend implements to host the generic persister.

use std::sync::Arc;

use kvmap_model::{Entity, Property};
use kvmap_types::Value;

use crate::error::{EngineError, EngineResult};
use crate::indexer::{AssociationIndexer, PropertyValueIndexer};
use crate::key::NativeKey;

/// Native-record operations of a key-value backend.
///
/// [`KeyValueEntityPersister`](crate::KeyValueEntityPersister) drives the
/// object graph; implementors only translate single records. The engine
/// never looks inside an `Entry` except through `get_entry_value` and
/// `set_entry_value`.
///
/// Invariants implementations must uphold:
/// - `retrieve_entry` returns `Ok(None)` for a missing key; `Err` is for
///   backend failures only.
/// - `store_entry` assigns and returns a fresh key.
/// - `update_entry` is idempotent for identical input.
/// - `delete_entries` with an empty slice is a no-op.
pub trait NativeEntryStore: Send + Sync + 'static {
    /// A native record.
    type Entry: Send;

    /// A native key.
    type Key: NativeKey;

    /// A fresh, empty, mutable record for `family`.
    fn create_new_entry(&self, family: &str) -> Self::Entry;

    /// The value under `key`, or `Value::Null` if absent.
    fn get_entry_value(&self, entry: &Self::Entry, key: &str) -> Value;

    /// Overwrite or insert the value under `key`.
    fn set_entry_value(&self, entry: &mut Self::Entry, key: &str, value: Value);

    /// Read an embedded value (a `Value::Map`).
    fn get_embedded(&self, entry: &Self::Entry, key: &str) -> Value {
        self.get_entry_value(entry, key)
    }

    /// Write an embedded value (a `Value::Map`).
    fn set_embedded(&self, entry: &mut Self::Entry, key: &str, value: Value) {
        self.set_entry_value(entry, key, value);
    }

    fn retrieve_entry(
        &self,
        entity: &Entity,
        family: &str,
        key: &Self::Key,
    ) -> EngineResult<Option<Self::Entry>>;

    /// Batch form of [`retrieve_entry`](Self::retrieve_entry).
    ///
    /// The result corresponds to `keys` position by position. The default
    /// loops; backends with a native batch read should override.
    fn retrieve_entries(
        &self,
        entity: &Entity,
        family: &str,
        keys: &[Self::Key],
    ) -> EngineResult<Vec<Option<Self::Entry>>> {
        keys.iter()
            .map(|k| self.retrieve_entry(entity, family, k))
            .collect()
    }

    /// Insert a new record and return its generated key.
    fn store_entry(&self, entity: &Entity, entry: Self::Entry) -> EngineResult<Self::Key>;

    fn update_entry(&self, entity: &Entity, key: &Self::Key, entry: Self::Entry)
        -> EngineResult<()>;

    fn delete_entries(&self, family: &str, keys: &[Self::Key]) -> EngineResult<()>;

    /// Indexer for the collection association `property` of `entity`, whose
    /// children are `target` instances. `None` if unsupported.
    fn association_indexer(
        &self,
        entity: &Entity,
        property: &Property,
        target: &Entity,
    ) -> Option<Arc<dyn AssociationIndexer>>;

    /// Indexer for an indexed property of `entity`. `None` means the backend
    /// indexes natively and needs no help on write.
    fn property_indexer(
        &self,
        _entity: &Entity,
        _property: &Property,
    ) -> Option<Arc<dyn PropertyValueIndexer>> {
        None
    }

    /// Convert a domain identifier into a native key.
    ///
    /// The default is [`NativeKey::from_value`]; override for key encodings
    /// that differ from the identifier's natural form.
    fn infer_native_key(&self, family: &str, identifier: &Value) -> EngineResult<Self::Key> {
        Self::Key::from_value(identifier).ok_or_else(|| EngineError::InvalidKey {
            family: family.to_string(),
            key: identifier.to_string(),
        })
    }
}
