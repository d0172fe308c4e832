//! Sessions: the unit-of-work entry point for persistence operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use kvmap_model::{
    object_address, same_object, Entity, FetchStrategy, MappingContext, ObjectRef,
};
use kvmap_types::{ConversionService, Value};
use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::error::{EngineError, EngineResult};
use crate::interceptor::EntityInterceptor;
use crate::persister::Persister;
use crate::transaction::Transaction;

type CacheKey = (String, Value);

pub(crate) struct SessionInner {
    datastore: Arc<Datastore>,
    details: BTreeMap<String, String>,
    persisters: Mutex<HashMap<String, Arc<dyn Persister>>>,
    cache: Mutex<HashMap<CacheKey, ObjectRef>>,
    interceptors: RwLock<Vec<Arc<dyn EntityInterceptor>>>,
    in_flight: Mutex<HashSet<usize>>,
    deleting: Mutex<HashSet<usize>>,
    transaction: Mutex<Option<Box<dyn Transaction>>>,
    connected: AtomicBool,
    depth: AtomicUsize,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> EngineResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|e| EngineError::LockPoisoned(e.to_string()))
}

/// A connection to a [`Datastore`].
///
/// `persist`, `retrieve`, and `delete` dispatch to the persister of the
/// object's entity, created on first use and cached per session. The session
/// also keeps an identity map of `(entity, identifier)` to object, so
/// repeated retrieves of one key return the same instance.
///
/// Clones share one session. A session is meant for one logical unit of
/// work at a time; it is `Send + Sync` but does not serialize concurrent
/// operations.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Marks an object as being persisted until dropped.
pub(crate) struct InFlightGuard {
    inner: Arc<SessionInner>,
    address: usize,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.inner.in_flight.lock() {
            set.remove(&self.address);
        }
    }
}

/// Tracks nesting of public operations; when the identity map is disabled
/// it is cleared as the outermost operation returns.
struct OperationGuard<'a> {
    inner: &'a SessionInner,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.inner.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !self.inner.datastore.config().first_level_cache {
            if let Ok(mut cache) = self.inner.cache.lock() {
                cache.clear();
            }
        }
    }
}

impl Session {
    pub(crate) fn open(datastore: Arc<Datastore>, details: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                datastore,
                details,
                persisters: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                interceptors: RwLock::new(Vec::new()),
                in_flight: Mutex::new(HashSet::new()),
                deleting: Mutex::new(HashSet::new()),
                transaction: Mutex::new(None),
                connected: AtomicBool::new(true),
                depth: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn enter(&self) -> EngineResult<OperationGuard<'_>> {
        if !self.is_connected() {
            return Err(EngineError::SessionClosed);
        }
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        Ok(OperationGuard { inner: &self.inner })
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.inner.datastore
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        self.inner.datastore.context()
    }

    pub fn conversions(&self) -> &Arc<ConversionService> {
        self.inner.datastore.conversions()
    }

    /// Connection details this session was opened with, configured defaults included.
    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.inner.details
    }

    pub fn default_fetch(&self) -> FetchStrategy {
        self.inner.datastore.config().default_fetch
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------
    // Persisters
    // ---------------------------------------------------------------

    /// The persister for entity `name`, created on first use.
    ///
    /// Fails with [`EngineError::NonPersistentType`] if `name` is not a
    /// registered entity.
    pub fn persister(&self, name: &str) -> EngineResult<Arc<dyn Persister>> {
        let entity = self.context().persistent_entity(name)?;
        if let Some(p) = lock(&self.inner.persisters)?
            .get(name)
            .filter(|p| entity.as_ref().is_some_and(|e| Arc::ptr_eq(p.entity(), e)))
        {
            return Ok(Arc::clone(p));
        }
        let persister = self.inner.datastore.persister(name)?;
        lock(&self.inner.persisters)?.insert(name.to_string(), Arc::clone(&persister));
        Ok(persister)
    }

    /// The persister for the runtime entity of `object`.
    pub fn persister_for(&self, object: &ObjectRef) -> EngineResult<Arc<dyn Persister>> {
        let name = entity_name_of(object)?;
        self.persister(&name)
    }

    // ---------------------------------------------------------------
    // CRUD
    // ---------------------------------------------------------------

    /// Insert or update `object` (and cascaded associations); returns its identifier.
    pub fn persist(&self, object: &ObjectRef) -> EngineResult<Value> {
        let _op = self.enter()?;
        self.persister_for(object)?.persist(self, object)
    }

    /// Persist several objects; identifiers correspond to `objects` by position.
    pub fn persist_all(&self, objects: &[ObjectRef]) -> EngineResult<Vec<Value>> {
        let _op = self.enter()?;
        let Some(first) = objects.first() else {
            return Ok(Vec::new());
        };
        let name = entity_name_of(first)?;
        let homogeneous = objects
            .iter()
            .map(entity_name_of)
            .collect::<EngineResult<Vec<_>>>()?
            .iter()
            .all(|n| *n == name);
        if homogeneous {
            self.persister(&name)?.persist_all(self, objects)
        } else {
            objects.iter().map(|o| self.persist(o)).collect()
        }
    }

    /// Load the `entity` stored under `key`. `Ok(None)` if absent.
    pub fn retrieve(&self, entity: &str, key: impl Into<Value>) -> EngineResult<Option<ObjectRef>> {
        let _op = self.enter()?;
        let persister = self.persister(entity)?;
        let key = self.normalize_key(persister.entity(), key.into())?;
        if let Some(cached) = self.cached(entity, &key)? {
            return Ok(Some(cached));
        }
        persister.retrieve(self, &key)
    }

    /// Load several objects of `entity`; results correspond to `keys` by
    /// position. Cached objects are served from the identity map and the
    /// rest are fetched in one batch.
    pub fn retrieve_all(&self, entity: &str, keys: &[Value]) -> EngineResult<Vec<Option<ObjectRef>>> {
        let _op = self.enter()?;
        let persister = self.persister(entity)?;

        let mut out: Vec<Option<ObjectRef>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut missing_keys = Vec::new();
        for key in keys {
            let key = self.normalize_key(persister.entity(), key.clone())?;
            match self.cached(entity, &key)? {
                Some(object) => out.push(Some(object)),
                None => {
                    missing.push(out.len());
                    missing_keys.push(key);
                    out.push(None);
                }
            }
        }

        if !missing_keys.is_empty() {
            let loaded = persister.retrieve_all(self, &missing_keys)?;
            for (slot, object) in missing.into_iter().zip(loaded) {
                out[slot] = object;
            }
        }
        Ok(out)
    }

    /// Delete `objects`, one backend batch per entity.
    ///
    /// Objects vetoed by an interceptor, unsaved objects, and objects whose
    /// delete is already in progress are skipped.
    pub fn delete(&self, objects: &[ObjectRef]) -> EngineResult<()> {
        let _op = self.enter()?;
        let mut claimed = Vec::new();
        let result = self.delete_claimed(objects, &mut claimed);
        let mut deleting = lock(&self.inner.deleting)?;
        for address in claimed {
            deleting.remove(&address);
        }
        result
    }

    fn delete_claimed(&self, objects: &[ObjectRef], claimed: &mut Vec<usize>) -> EngineResult<()> {
        // Group by entity, keeping first-seen order.
        let mut groups: Vec<(Arc<dyn Persister>, Vec<ObjectRef>)> = Vec::new();
        for object in objects {
            let address = object_address(object);
            if lock(&self.inner.deleting)?.contains(&address) {
                continue;
            }
            let persister = self.persister_for(object)?;
            if !self.allow_delete(persister.entity(), object) {
                debug!(entity = %persister.entity().name(), "delete vetoed");
                continue;
            }
            if !lock(&self.inner.deleting)?.insert(address) {
                continue;
            }
            claimed.push(address);
            match groups
                .iter_mut()
                .find(|(p, _)| p.entity().name() == persister.entity().name())
            {
                Some((_, group)) => group.push(Arc::clone(object)),
                None => groups.push((persister, vec![Arc::clone(object)])),
            }
        }

        for (persister, group) in &groups {
            persister.delete(self, group)?;
        }
        Ok(())
    }

    /// Objects of `entity` whose indexed `property` equals `value`.
    pub fn retrieve_by_property(
        &self,
        entity: &str,
        property: &str,
        value: impl Into<Value>,
        offset: usize,
        max: Option<usize>,
    ) -> EngineResult<Vec<ObjectRef>> {
        let _op = self.enter()?;
        let keys = self
            .persister(entity)?
            .query_by_property(property, &value.into(), offset, max)?;
        Ok(self
            .retrieve_all(entity, &keys)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Current identifier of `object`, `None` while unsaved.
    pub fn identifier_of(&self, object: &ObjectRef) -> EngineResult<Option<Value>> {
        self.persister_for(object)?.object_identifier(object)
    }

    // ---------------------------------------------------------------
    // Identity map
    // ---------------------------------------------------------------

    /// `true` if this exact instance is in the identity map.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.inner
            .cache
            .lock()
            .map(|cache| cache.values().any(|o| same_object(o, object)))
            .unwrap_or(false)
    }

    /// Put an already saved object into the identity map.
    ///
    /// Returns `false` (and does nothing) if the object has no identifier.
    pub fn attach(&self, object: &ObjectRef) -> EngineResult<bool> {
        let persister = self.persister_for(object)?;
        match persister.object_identifier(object)? {
            Some(id) => {
                self.register(persister.entity().name(), id, object)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove this instance from the identity map.
    pub fn evict(&self, object: &ObjectRef) -> EngineResult<()> {
        lock(&self.inner.cache)?.retain(|_, o| !same_object(o, object));
        Ok(())
    }

    /// Empty the identity map.
    pub fn clear(&self) -> EngineResult<()> {
        lock(&self.inner.cache)?.clear();
        Ok(())
    }

    pub(crate) fn cached(&self, entity: &str, key: &Value) -> EngineResult<Option<ObjectRef>> {
        Ok(lock(&self.inner.cache)?
            .get(&(entity.to_string(), key.clone()))
            .cloned())
    }

    pub(crate) fn register(&self, entity: &str, key: Value, object: &ObjectRef) -> EngineResult<()> {
        lock(&self.inner.cache)?.insert((entity.to_string(), key), Arc::clone(object));
        Ok(())
    }

    pub(crate) fn evict_key(&self, entity: &str, key: &Value) -> EngineResult<()> {
        lock(&self.inner.cache)?.remove(&(entity.to_string(), key.clone()));
        Ok(())
    }

    fn normalize_key(&self, entity: &Entity, key: Value) -> EngineResult<Value> {
        let target = entity.identity()?.value_type();
        Ok(self.conversions().convert_owned(key, target)?)
    }

    /// Mark `object` as being persisted. `None` if it already is.
    pub(crate) fn mark_in_flight(&self, object: &ObjectRef) -> EngineResult<Option<InFlightGuard>> {
        let address = object_address(object);
        if !lock(&self.inner.in_flight)?.insert(address) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            address,
        }))
    }

    // ---------------------------------------------------------------
    // Interceptors
    // ---------------------------------------------------------------

    pub fn add_entity_interceptor(&self, interceptor: Arc<dyn EntityInterceptor>) -> EngineResult<()> {
        self.inner
            .interceptors
            .write()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))?
            .push(interceptor);
        Ok(())
    }

    fn interceptors(&self) -> Vec<Arc<dyn EntityInterceptor>> {
        self.inner
            .interceptors
            .read()
            .map(|i| i.to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn allow_insert(&self, entity: &Entity, object: &ObjectRef) -> bool {
        self.interceptors()
            .iter()
            .all(|i| i.before_insert(entity, object))
    }

    pub(crate) fn allow_update(&self, entity: &Entity, object: &ObjectRef) -> bool {
        self.interceptors()
            .iter()
            .all(|i| i.before_update(entity, object))
    }

    pub(crate) fn allow_delete(&self, entity: &Entity, object: &ObjectRef) -> bool {
        self.interceptors()
            .iter()
            .all(|i| i.before_delete(entity, object))
    }

    // ---------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------

    /// Start a backend transaction. A no-op if one is already active.
    pub fn begin_transaction(&self) -> EngineResult<()> {
        if !self.is_connected() {
            return Err(EngineError::SessionClosed);
        }
        let mut slot = lock(&self.inner.transaction)?;
        if slot.as_ref().is_some_and(|t| t.is_active()) {
            debug!("transaction already active");
            return Ok(());
        }
        *slot = Some(self.inner.datastore.backend().begin_transaction()?);
        debug!("transaction started");
        Ok(())
    }

    pub fn commit_transaction(&self) -> EngineResult<()> {
        let transaction = lock(&self.inner.transaction)?
            .take()
            .ok_or(EngineError::NoTransaction)?;
        transaction.commit()?;
        debug!("transaction committed");
        Ok(())
    }

    /// Roll back the active transaction and empty the identity map, whose
    /// objects may reflect rolled-back writes.
    pub fn rollback_transaction(&self) -> EngineResult<()> {
        let transaction = lock(&self.inner.transaction)?
            .take()
            .ok_or(EngineError::NoTransaction)?;
        transaction.rollback()?;
        self.clear()?;
        debug!("transaction rolled back");
        Ok(())
    }

    pub fn has_active_transaction(&self) -> bool {
        self.inner
            .transaction
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| t.is_active()))
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Close the session. An active transaction is rolled back. Later
    /// operations fail with [`EngineError::SessionClosed`] and lazy
    /// collections loaded from it report themselves detached.
    pub fn disconnect(&self) -> EngineResult<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let pending = lock(&self.inner.transaction)?.take();
        if let Some(transaction) = pending.filter(|t| t.is_active()) {
            warn!("disconnecting with an active transaction; rolling back");
            transaction.rollback()?;
        }
        self.clear()?;
        debug!("session disconnected");
        Ok(())
    }
}

fn entity_name_of(object: &ObjectRef) -> EngineResult<String> {
    let guard = object
        .read()
        .map_err(|e| EngineError::LockPoisoned(e.to_string()))?;
    Ok(guard.entity_name().to_string())
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.inner.cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .field("details", &self.inner.details)
            .field("cached", &cached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use kvmap_model::{object_ref, with_object_mut, CollectionError};

    use super::*;
    use crate::config::DatastoreConfig;
    use crate::fixtures::*;
    use crate::memory::BackendCall;

    struct Veto {
        insert: bool,
        update: bool,
        keep_title: Option<&'static str>,
        seen: AtomicUsize,
    }

    impl Veto {
        fn allowing() -> Self {
            Self {
                insert: true,
                update: true,
                keep_title: None,
                seen: AtomicUsize::new(0),
            }
        }
    }

    impl EntityInterceptor for Veto {
        fn before_insert(&self, _entity: &Entity, _object: &ObjectRef) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.insert
        }

        fn before_update(&self, _entity: &Entity, _object: &ObjectRef) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.update
        }

        fn before_delete(&self, entity: &Entity, object: &ObjectRef) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            !(entity.name() == BOOK && self.keep_title == Some(book_title(object).as_str()))
        }
    }

    // ---- Test 1: one key, one instance ----
    #[test]
    fn identity_map_returns_same_instance() {
        let (session, store) = session();
        let author = Author::named("Ursula");
        session.persist(&author).unwrap();
        assert!(session.contains(&author));
        store.clear_calls();

        let a = session.retrieve(AUTHOR, 1).unwrap().unwrap();
        let b = session.retrieve(AUTHOR, "1").unwrap().unwrap();
        assert!(same_object(&a, &author));
        assert!(same_object(&b, &author));
        assert!(store.calls().is_empty());

        session.evict(&author).unwrap();
        assert!(!session.contains(&author));
        let c = session.retrieve(AUTHOR, 1).unwrap().unwrap();
        assert!(!same_object(&c, &author));
        assert_eq!(author_name(&c), "Ursula");
    }

    // ---- Test 2: attach only accepts saved objects ----
    #[test]
    fn attach_registers_saved_objects() {
        let (session, store) = session();
        let unsaved = Author::named("Nobody");
        assert!(!session.attach(&unsaved).unwrap());

        let saved = object_ref(Author {
            id: Some(7),
            name: "Detached".into(),
            ..Author::default()
        });
        assert!(session.attach(&saved).unwrap());
        let found = session.retrieve(AUTHOR, 7).unwrap().unwrap();
        assert!(same_object(&found, &saved));
        assert!(store.calls().is_empty());

        session.clear().unwrap();
        assert!(!session.contains(&saved));
        assert!(session.retrieve(AUTHOR, 7).unwrap().is_none());
    }

    // ---- Test 3: without the identity map, cycles still resolve within one call ----
    #[test]
    fn disabled_cache_still_resolves_cycles() {
        let config = DatastoreConfig {
            default_fetch: FetchStrategy::Eager,
            first_level_cache: false,
            ..DatastoreConfig::default()
        };
        let (datastore, _store) = datastore_with(context_with(author_declaration(None)), config);
        let session = datastore.connect(BTreeMap::new());
        let author = Author::named("Ursula");
        add_book(&author, &Book::titled("A"));
        session.persist(&author).unwrap();
        assert!(!session.contains(&author));

        let first = session.retrieve(AUTHOR, 1).unwrap().unwrap();
        let second = session.retrieve(AUTHOR, 1).unwrap().unwrap();
        assert!(!same_object(&first, &second));

        let books = author_books(&first).unwrap().to_vec().unwrap();
        assert!(same_object(&book_author(&books[0]).unwrap(), &first));
    }

    // ---- Test 4: insert veto fails the persist ----
    #[test]
    fn insert_veto_stores_nothing() {
        let (session, store) = session();
        session
            .add_entity_interceptor(Arc::new(Veto {
                insert: false,
                ..Veto::allowing()
            }))
            .unwrap();

        let err = session.persist(&Author::named("Ursula")).unwrap_err();
        assert!(matches!(err, EngineError::PersistVetoed { ref entity } if entity == AUTHOR));
        assert_eq!(store.count("authors").unwrap(), 0);
    }

    // ---- Test 5: update veto keeps the stored record ----
    #[test]
    fn update_veto_skips_write() {
        let (session, store) = session();
        let author = Author::named("Ursula");
        let id = session.persist(&author).unwrap();

        let veto = Arc::new(Veto {
            update: false,
            ..Veto::allowing()
        });
        session.add_entity_interceptor(veto.clone()).unwrap();
        store.clear_calls();

        with_object_mut::<Author, _>(&author, |a| a.name = "Changed".into());
        assert_eq!(session.persist(&author).unwrap(), id);
        assert_eq!(veto.seen.load(Ordering::SeqCst), 1);
        assert!(!store
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::UpdateEntry { .. })));
        let record = store.record("authors", &id).unwrap().unwrap();
        assert_eq!(record["name"], Value::from("Ursula"));
    }

    // ---- Test 6: delete veto drops the object from the batch ----
    #[test]
    fn delete_veto_excludes_object() {
        let (session, store) = session();
        let keep = Book::titled("Keep");
        let discard = Book::titled("Discard");
        session.persist_all(&[keep.clone(), discard.clone()]).unwrap();
        session
            .add_entity_interceptor(Arc::new(Veto {
                keep_title: Some("Keep"),
                ..Veto::allowing()
            }))
            .unwrap();
        store.clear_calls();

        session.delete(&[keep.clone(), discard]).unwrap();
        let deletes: Vec<BackendCall> = store
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::DeleteEntries { .. }))
            .collect();
        assert_eq!(
            deletes,
            vec![BackendCall::DeleteEntries {
                family: "books".into(),
                keys: vec![Value::Int(2)],
            }]
        );
        assert!(store.record("books", &Value::Int(1)).unwrap().is_some());
        assert!(session.contains(&keep));
    }

    // ---- Test 7: rollback undoes writes and empties the identity map ----
    #[test]
    fn rollback_discards_writes() {
        let (session, store) = session();
        assert!(matches!(session.commit_transaction(), Err(EngineError::NoTransaction)));

        session.begin_transaction().unwrap();
        session.begin_transaction().unwrap();
        assert!(session.has_active_transaction());
        let author = Author::named("Ursula");
        session.persist(&author).unwrap();
        assert_eq!(store.count("authors").unwrap(), 1);

        session.rollback_transaction().unwrap();
        assert!(!session.has_active_transaction());
        assert_eq!(store.count("authors").unwrap(), 0);
        assert!(!session.contains(&author));
        assert!(matches!(session.rollback_transaction(), Err(EngineError::NoTransaction)));
    }

    // ---- Test 8: commit keeps writes ----
    #[test]
    fn commit_keeps_writes() {
        let (session, store) = session();
        session.begin_transaction().unwrap();
        session.persist(&Author::named("Ursula")).unwrap();
        session.commit_transaction().unwrap();
        assert!(!session.has_active_transaction());
        assert_eq!(store.count("authors").unwrap(), 1);
    }

    // ---- Test 9: disconnect rolls back and closes ----
    #[test]
    fn disconnect_closes_session() {
        let (session, store) = session();
        session.begin_transaction().unwrap();
        session.persist(&Author::named("Ursula")).unwrap();
        session.disconnect().unwrap();
        session.disconnect().unwrap();

        assert!(!session.is_connected());
        assert_eq!(store.count("authors").unwrap(), 0);
        assert!(matches!(
            session.persist(&Author::named("Late")),
            Err(EngineError::SessionClosed)
        ));
        assert!(matches!(session.retrieve(AUTHOR, 1), Err(EngineError::SessionClosed)));
        assert!(matches!(session.begin_transaction(), Err(EngineError::SessionClosed)));
    }

    // ---- Test 10: lazy collections outlive their session only as detached ----
    #[test]
    fn lazy_collection_detached_after_disconnect() {
        let (datastore, _store) = datastore();
        datastore
            .with_session(BTreeMap::new(), |s| {
                let author = Author::named("Ursula");
                add_book(&author, &Book::titled("A"));
                s.persist(&author)
            })
            .unwrap();

        let author = datastore
            .with_session(BTreeMap::new(), |s| s.retrieve(AUTHOR, 1))
            .unwrap()
            .unwrap();
        let books = author_books(&author).unwrap();
        assert!(matches!(books.to_vec(), Err(CollectionError::Detached)));
        // A failed load leaves the collection loadable later.
        assert!(!books.is_initialized());
    }

    // ---- Test 11: unmapped types are rejected ----
    #[test]
    fn unmapped_types_are_rejected() {
        let (session, _store) = session();
        assert!(matches!(
            session.retrieve("test.Nope", 1),
            Err(EngineError::NonPersistentType { ref name }) if name == "test.Nope"
        ));
        let err = session.persist(&Address::at("Main St", "Portland")).unwrap_err();
        assert!(matches!(err, EngineError::NonPersistentType { ref name } if name == ADDRESS));
        assert!(err.is_configuration_error());
    }

    // ---- Test 12: mixed batches go to each entity's persister ----
    #[test]
    fn persist_all_mixed_entities() {
        let (session, store) = session();
        let ids = session
            .persist_all(&[Author::named("Ursula"), Book::titled("A"), Author::named("Octavia")])
            .unwrap();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
        assert_eq!(store.count("authors").unwrap(), 2);
        assert_eq!(store.count("books").unwrap(), 1);
        assert!(session.persist_all(&[]).unwrap().is_empty());
    }

    // ---- Test 13: a replaced entity gets a fresh persister ----
    #[test]
    fn replaced_entity_refreshes_session_persister() {
        let (session, _store) = session();
        let before = session.persister(AUTHOR).unwrap();
        let replaced = session.context().add_persistent_entity(AUTHOR).unwrap();

        let after = session.persister(AUTHOR).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(after.entity(), &replaced));
        assert!(Arc::ptr_eq(&after, &session.datastore().persister(AUTHOR).unwrap()));

        let id = session.persist(&Author::named("Ursula")).unwrap();
        assert!(session.retrieve(AUTHOR, id).unwrap().is_some());
    }
}
