//! In-memory reference backend for testing and ephemeral use.
//!
//! [`InMemoryStore`] keeps every family, association index, and property
//! index in `HashMap`s behind one `RwLock`. Records are
//! `BTreeMap<String, Value>` and native keys are plain [`Value`]s. Every hook
//! call is appended to a call log ([`BackendCall`]) so tests can assert on
//! the exact sequence of backend operations.
//!
//! Data is lost when the last handle is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kvmap_model::{Entity, Property, PropertyKind};
use kvmap_types::{ConversionService, Value};
use tracing::trace;
use uuid::Uuid;

use crate::datastore::Backend;
use crate::error::{EngineError, EngineResult};
use crate::indexer::{AssociationIndexer, Indexer, PropertyValueIndexer};
use crate::persister::{KeyValueEntityPersister, Persister};
use crate::store::NativeEntryStore;
use crate::transaction::Transaction;

/// A native record of the in-memory backend.
pub type Record = BTreeMap<String, Value>;

/// One recorded backend operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    CreateNewEntry { family: String },
    RetrieveEntry { family: String, key: Value },
    StoreEntry { family: String, key: Value },
    UpdateEntry { family: String, key: Value },
    DeleteEntries { family: String, keys: Vec<Value> },
    Index { family: String, property: String, owner: Value, children: Vec<Value> },
    Query { family: String, property: String, owner: Value },
    IndexValue { family: String, property: String, value: Value, owner: Value },
    DeindexValue { family: String, property: String, value: Value, owner: Value },
    QueryValue { family: String, property: String, value: Value },
}

/// `(family, property)` of an index.
type IndexName = (String, String);

/// Key to member keys, members in first-indexed order without duplicates.
type Postings = HashMap<Value, Vec<Value>>;

/// Owner to child postings of one association; children live in `child_family`.
#[derive(Clone, Debug, Default)]
struct AssociationPostings {
    child_family: String,
    postings: Postings,
}

#[derive(Clone, Debug, Default)]
struct State {
    families: HashMap<String, HashMap<Value, Record>>,
    counters: HashMap<String, i64>,
    associations: HashMap<IndexName, AssociationPostings>,
    property_values: HashMap<IndexName, Postings>,
}

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<State>,
    calls: Mutex<Vec<BackendCall>>,
}

impl Shared {
    fn read(&self) -> EngineResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))
    }

    fn record(&self, call: BackendCall) {
        trace!(?call, "memory backend call");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

fn add_posting(postings: &mut Postings, key: &Value, member: &Value) {
    let members = postings.entry(key.clone()).or_default();
    if !members.contains(member) {
        members.push(member.clone());
    }
}

/// In-memory [`NativeEntryStore`]. Clones share the same data.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every hook call so far, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.shared
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.shared.calls.lock() {
            calls.clear();
        }
    }

    /// Number of records in `family`.
    pub fn count(&self, family: &str) -> EngineResult<usize> {
        Ok(self.shared.read()?.families.get(family).map_or(0, HashMap::len))
    }

    /// A copy of the raw record, bypassing the call log.
    pub fn record(&self, family: &str, key: &Value) -> EngineResult<Option<Record>> {
        Ok(self
            .shared
            .read()?
            .families
            .get(family)
            .and_then(|f| f.get(key))
            .cloned())
    }

    fn snapshot(&self) -> EngineResult<State> {
        Ok(self.shared.read()?.clone())
    }

    fn restore(&self, state: State) -> EngineResult<()> {
        *self.shared.write()? = state;
        Ok(())
    }

    fn generate_key(&self, state: &mut State, entity: &Entity, family: &str) -> EngineResult<Value> {
        let generator = match &entity.identity()?.kind {
            PropertyKind::Identity(id) => id.generator.clone(),
            _ => None,
        };
        match generator.as_deref() {
            None | Some("increment") => {
                let counter = state.counters.entry(family.to_string()).or_insert(0);
                *counter += 1;
                Ok(Value::Int(*counter))
            }
            Some("uuid") => Ok(Value::Text(Uuid::now_v7().to_string())),
            Some(other) => Err(EngineError::Config(format!(
                "unsupported identity generator {other:?} for {}",
                entity.name()
            ))),
        }
    }
}

impl NativeEntryStore for InMemoryStore {
    type Entry = Record;
    type Key = Value;

    fn create_new_entry(&self, family: &str) -> Record {
        self.shared.record(BackendCall::CreateNewEntry {
            family: family.to_string(),
        });
        Record::new()
    }

    fn get_entry_value(&self, entry: &Record, key: &str) -> Value {
        entry.get(key).cloned().unwrap_or_default()
    }

    fn set_entry_value(&self, entry: &mut Record, key: &str, value: Value) {
        entry.insert(key.to_string(), value);
    }

    fn retrieve_entry(&self, _entity: &Entity, family: &str, key: &Value) -> EngineResult<Option<Record>> {
        self.shared.record(BackendCall::RetrieveEntry {
            family: family.to_string(),
            key: key.clone(),
        });
        self.record(family, key)
    }

    fn store_entry(&self, entity: &Entity, entry: Record) -> EngineResult<Value> {
        let family = entity.family();
        let key = {
            let mut state = self.shared.write()?;
            let key = self.generate_key(&mut state, entity, family)?;
            state
                .families
                .entry(family.to_string())
                .or_default()
                .insert(key.clone(), entry);
            key
        };
        self.shared.record(BackendCall::StoreEntry {
            family: family.to_string(),
            key: key.clone(),
        });
        Ok(key)
    }

    fn update_entry(&self, entity: &Entity, key: &Value, entry: Record) -> EngineResult<()> {
        let family = entity.family();
        self.shared
            .write()?
            .families
            .entry(family.to_string())
            .or_default()
            .insert(key.clone(), entry);
        self.shared.record(BackendCall::UpdateEntry {
            family: family.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    fn delete_entries(&self, family: &str, keys: &[Value]) -> EngineResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.shared.write()?;
            if let Some(records) = state.families.get_mut(family) {
                for key in keys {
                    records.remove(key);
                }
            }
            // Deleted owners lose their postings; deleted children leave
            // every owner they were indexed under.
            for (name, association) in &mut state.associations {
                if name.0 == family {
                    for key in keys {
                        association.postings.remove(key);
                    }
                }
                if association.child_family == family {
                    for members in association.postings.values_mut() {
                        members.retain(|m| !keys.contains(m));
                    }
                    association.postings.retain(|_, members| !members.is_empty());
                }
            }
        }
        self.shared.record(BackendCall::DeleteEntries {
            family: family.to_string(),
            keys: keys.to_vec(),
        });
        Ok(())
    }

    fn association_indexer(
        &self,
        entity: &Entity,
        property: &Property,
        target: &Entity,
    ) -> Option<Arc<dyn AssociationIndexer>> {
        property.collection()?;
        Some(Arc::new(InMemoryAssociationIndexer {
            shared: Arc::clone(&self.shared),
            name: (entity.family().to_string(), property.target_key().to_string()),
            target: target.name().to_string(),
            child_family: target.family().to_string(),
        }))
    }

    fn property_indexer(
        &self,
        entity: &Entity,
        property: &Property,
    ) -> Option<Arc<dyn PropertyValueIndexer>> {
        Some(Arc::new(InMemoryPropertyIndexer {
            shared: Arc::clone(&self.shared),
            name: (entity.family().to_string(), property.target_key().to_string()),
        }))
    }
}

/// Association index over the shared state.
struct InMemoryAssociationIndexer {
    shared: Arc<Shared>,
    name: IndexName,
    target: String,
    child_family: String,
}

impl Indexer for InMemoryAssociationIndexer {
    fn index(&self, owner: &Value, children: &[Value]) -> EngineResult<()> {
        {
            let mut state = self.shared.write()?;
            let association = state
                .associations
                .entry(self.name.clone())
                .or_insert_with(|| AssociationPostings {
                    child_family: self.child_family.clone(),
                    postings: Postings::new(),
                });
            for child in children {
                add_posting(&mut association.postings, owner, child);
            }
        }
        self.shared.record(BackendCall::Index {
            family: self.name.0.clone(),
            property: self.name.1.clone(),
            owner: owner.clone(),
            children: children.to_vec(),
        });
        Ok(())
    }

    fn query(&self, owner: &Value) -> EngineResult<Vec<Value>> {
        self.shared.record(BackendCall::Query {
            family: self.name.0.clone(),
            property: self.name.1.clone(),
            owner: owner.clone(),
        });
        Ok(self
            .shared
            .read()?
            .associations
            .get(&self.name)
            .and_then(|a| a.postings.get(owner))
            .cloned()
            .unwrap_or_default())
    }
}

impl AssociationIndexer for InMemoryAssociationIndexer {
    fn indexed_entity(&self) -> &str {
        &self.target
    }
}

/// Property-value index over the shared state.
struct InMemoryPropertyIndexer {
    shared: Arc<Shared>,
    name: IndexName,
}

impl PropertyValueIndexer for InMemoryPropertyIndexer {
    fn index(&self, value: &Value, owner: &Value) -> EngineResult<()> {
        {
            let mut state = self.shared.write()?;
            let postings = state.property_values.entry(self.name.clone()).or_default();
            add_posting(postings, value, owner);
        }
        self.shared.record(BackendCall::IndexValue {
            family: self.name.0.clone(),
            property: self.name.1.clone(),
            value: value.clone(),
            owner: owner.clone(),
        });
        Ok(())
    }

    fn deindex(&self, value: &Value, owner: &Value) -> EngineResult<()> {
        {
            let mut state = self.shared.write()?;
            if let Some(postings) = state.property_values.get_mut(&self.name) {
                if let Some(owners) = postings.get_mut(value) {
                    owners.retain(|o| o != owner);
                    if owners.is_empty() {
                        postings.remove(value);
                    }
                }
            }
        }
        self.shared.record(BackendCall::DeindexValue {
            family: self.name.0.clone(),
            property: self.name.1.clone(),
            value: value.clone(),
            owner: owner.clone(),
        });
        Ok(())
    }

    fn query_range(
        &self,
        value: &Value,
        offset: usize,
        max: Option<usize>,
    ) -> EngineResult<Vec<Value>> {
        self.shared.record(BackendCall::QueryValue {
            family: self.name.0.clone(),
            property: self.name.1.clone(),
            value: value.clone(),
        });
        let state = self.shared.read()?;
        let owners = state
            .property_values
            .get(&self.name)
            .and_then(|p| p.get(value))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(owners
            .iter()
            .skip(offset)
            .take(max.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

/// Snapshot transaction: rollback restores the state captured at begin.
struct InMemoryTransaction {
    store: InMemoryStore,
    snapshot: Mutex<Option<State>>,
}

impl InMemoryTransaction {
    fn take(&self) -> EngineResult<Option<State>> {
        Ok(self
            .snapshot
            .lock()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))?
            .take())
    }
}

impl Transaction for InMemoryTransaction {
    fn commit(&self) -> EngineResult<()> {
        self.take()?.map(|_| ()).ok_or(EngineError::NoTransaction)
    }

    fn rollback(&self) -> EngineResult<()> {
        let snapshot = self.take()?.ok_or(EngineError::NoTransaction)?;
        self.store.restore(snapshot)
    }

    fn is_active(&self) -> bool {
        self.snapshot.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

/// [`Backend`] over an [`InMemoryStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    store: InMemoryStore,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: InMemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }
}

impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn create_persister(
        &self,
        entity: Arc<Entity>,
        conversions: Arc<ConversionService>,
    ) -> EngineResult<Arc<dyn Persister>> {
        Ok(Arc::new(KeyValueEntityPersister::new(
            entity,
            Arc::new(self.store.clone()),
            conversions,
        )))
    }

    fn begin_transaction(&self) -> EngineResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.store.clone(),
            snapshot: Mutex::new(Some(self.store.snapshot()?)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer(store: &InMemoryStore) -> InMemoryAssociationIndexer {
        InMemoryAssociationIndexer {
            shared: Arc::clone(&store.shared),
            name: ("authors".into(), "books".into()),
            target: "test.Book".into(),
            child_family: "books".into(),
        }
    }

    // ---- Test 1: indexing the same pair twice stores it once ----
    #[test]
    fn index_is_idempotent() {
        let store = InMemoryStore::new();
        let idx = indexer(&store);
        let owner = Value::Int(1);
        idx.index(&owner, &[Value::Int(10)]).unwrap();
        idx.index(&owner, &[Value::Int(10)]).unwrap();
        assert_eq!(idx.query(&owner).unwrap(), vec![Value::Int(10)]);
        assert_eq!(idx.indexed_entity(), "test.Book");
    }

    // ---- Test 2: unknown owner yields an empty list ----
    #[test]
    fn query_unknown_owner_is_empty() {
        let store = InMemoryStore::new();
        assert!(indexer(&store).query(&Value::Int(99)).unwrap().is_empty());
    }

    // ---- Test 3: property index paging ----
    #[test]
    fn property_index_pages_results() {
        let store = InMemoryStore::new();
        let idx = InMemoryPropertyIndexer {
            shared: Arc::clone(&store.shared),
            name: ("authors".into(), "name".into()),
        };
        let name = Value::from("Ursula");
        for owner in 1..=5 {
            idx.index(&name, &Value::Int(owner)).unwrap();
        }
        idx.index(&name, &Value::Int(3)).unwrap();
        assert_eq!(idx.query(&name).unwrap().len(), 5);
        assert_eq!(
            idx.query_range(&name, 1, Some(2)).unwrap(),
            vec![Value::Int(2), Value::Int(3)]
        );
        assert!(idx.query_range(&name, 10, None).unwrap().is_empty());
    }

    // ---- Test 4: empty delete is a no-op and not logged ----
    #[test]
    fn empty_delete_is_noop() {
        let store = InMemoryStore::new();
        store.delete_entries("authors", &[]).unwrap();
        assert!(store.calls().is_empty());
    }

    // ---- Test 5: deindexing drops one owner and empties the value ----
    #[test]
    fn property_deindex_forgets_owner() {
        let store = InMemoryStore::new();
        let idx = InMemoryPropertyIndexer {
            shared: Arc::clone(&store.shared),
            name: ("authors".into(), "name".into()),
        };
        let name = Value::from("Ursula");
        idx.index(&name, &Value::Int(1)).unwrap();
        idx.index(&name, &Value::Int(2)).unwrap();

        idx.deindex(&name, &Value::Int(1)).unwrap();
        assert_eq!(idx.query(&name).unwrap(), vec![Value::Int(2)]);
        idx.deindex(&name, &Value::Int(2)).unwrap();
        idx.deindex(&Value::from("Nobody"), &Value::Int(2)).unwrap();
        assert!(idx.query(&name).unwrap().is_empty());
        assert!(store.shared.read().unwrap().property_values[&idx.name].is_empty());
        assert!(matches!(
            store.calls().last(),
            Some(BackendCall::DeindexValue { property, .. }) if property == "name"
        ));
    }

    // ---- Test 6: deleting children or owners clears their postings ----
    #[test]
    fn delete_clears_association_postings() {
        let store = InMemoryStore::new();
        let idx = indexer(&store);
        let owner = Value::Int(1);
        idx.index(&owner, &[Value::Int(10), Value::Int(11)]).unwrap();
        idx.index(&Value::Int(2), &[Value::Int(10)]).unwrap();

        store.delete_entries("books", &[Value::Int(10)]).unwrap();
        assert_eq!(idx.query(&owner).unwrap(), vec![Value::Int(11)]);
        assert!(idx.query(&Value::Int(2)).unwrap().is_empty());

        store.delete_entries("authors", &[owner.clone()]).unwrap();
        assert!(idx.query(&owner).unwrap().is_empty());
        let state = store.shared.read().unwrap();
        assert!(state.associations[&idx.name].postings.is_empty());
    }

    // ---- Test 7: rollback restores the snapshot ----
    #[test]
    fn rollback_restores_state() {
        let backend = InMemoryBackend::new();
        let store = backend.store().clone();
        store
            .shared
            .write()
            .unwrap()
            .families
            .entry("authors".into())
            .or_default()
            .insert(Value::Int(1), Record::new());

        let tx = backend.begin_transaction().unwrap();
        assert!(tx.is_active());
        store.delete_entries("authors", &[Value::Int(1)]).unwrap();
        assert_eq!(store.count("authors").unwrap(), 0);
        tx.rollback().unwrap();
        assert!(!tx.is_active());
        assert_eq!(store.count("authors").unwrap(), 1);
        assert!(matches!(tx.commit(), Err(EngineError::NoTransaction)));
    }
}
