//! The generic key-value entity persister.
//!
//! [`KeyValueEntityPersister`] walks an object graph through the metamodel
//! and turns it into native-record operations on a [`NativeEntryStore`].
//! It knows nothing about the shape of the backend's records.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use kvmap_model::{
    CollectionAssociation, CollectionError, CollectionLoader, CollectionResult, EmbeddedType,
    Entity, EntityAccess, FetchStrategy, ModelError, ObjectRef, PersistentCollection, Property,
    PropertyKind, PropertyValue, ToOne,
};
use kvmap_types::{ConversionService, Value};
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::indexer::{AssociationIndexer, PropertyValueIndexer};
use crate::key::NativeKey;
use crate::session::{Session, SessionInner};
use crate::store::NativeEntryStore;

/// Type-erased persistence operations for one entity.
///
/// A [`Session`] dispatches to the persister of an object's entity; the
/// persister calls back into the session for associated objects so that
/// caching, interception, and the cycle guard apply to the whole graph.
pub trait Persister: Send + Sync {
    fn entity(&self) -> &Arc<Entity>;

    /// Insert or update `object` and return its identifier.
    fn persist(&self, session: &Session, object: &ObjectRef) -> EngineResult<Value>;

    /// Persist several objects; identifiers correspond to `objects` by position.
    ///
    /// The default loops over [`persist`](Self::persist).
    fn persist_all(&self, session: &Session, objects: &[ObjectRef]) -> EngineResult<Vec<Value>> {
        objects.iter().map(|o| self.persist(session, o)).collect()
    }

    /// Load the object stored under `key`; `Ok(None)` if there is none.
    fn retrieve(&self, session: &Session, key: &Value) -> EngineResult<Option<ObjectRef>>;

    /// Load several objects; results correspond to `keys` by position.
    ///
    /// The default loops over [`retrieve`](Self::retrieve).
    fn retrieve_all(
        &self,
        session: &Session,
        keys: &[Value],
    ) -> EngineResult<Vec<Option<ObjectRef>>> {
        keys.iter().map(|k| self.retrieve(session, k)).collect()
    }

    /// Delete `objects`, all of this persister's entity, in one backend batch.
    fn delete(&self, session: &Session, objects: &[ObjectRef]) -> EngineResult<()>;

    /// Owner keys whose indexed `property` equals `value`.
    fn query_by_property(
        &self,
        property: &str,
        value: &Value,
        offset: usize,
        max: Option<usize>,
    ) -> EngineResult<Vec<Value>>;

    /// Current identifier of `object`, `None` while unsaved.
    fn object_identifier(&self, object: &ObjectRef) -> EngineResult<Option<Value>>;
}

/// [`Persister`] over any [`NativeEntryStore`].
pub struct KeyValueEntityPersister<S: NativeEntryStore> {
    entity: Arc<Entity>,
    store: Arc<S>,
    conversions: Arc<ConversionService>,
}

impl<S: NativeEntryStore> KeyValueEntityPersister<S> {
    pub fn new(entity: Arc<Entity>, store: Arc<S>, conversions: Arc<ConversionService>) -> Self {
        Self {
            entity,
            store,
            conversions,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn access<'a>(&'a self, object: &'a ObjectRef) -> EntityAccess<'a> {
        EntityAccess::new(&self.entity, object, &self.conversions)
    }

    fn family(&self) -> &str {
        self.entity.family()
    }

    fn association_indexer(
        &self,
        session: &Session,
        property: &Property,
    ) -> EngineResult<Arc<dyn AssociationIndexer>> {
        let target = session
            .context()
            .associated_entity(&self.entity, &property.name)?;
        self.store
            .association_indexer(&self.entity, property, &target)
            .ok_or_else(|| EngineError::MissingAssociationIndexer {
                entity: self.entity.name().to_string(),
                property: property.name.clone(),
            })
    }

    // ---------------------------------------------------------------
    // Retrieve
    // ---------------------------------------------------------------

    /// Build the domain object for a found record.
    fn materialize(
        &self,
        session: &Session,
        native: &S::Key,
        entry: &S::Entry,
    ) -> EngineResult<ObjectRef> {
        let key = native.to_value();
        let object = self.entity.new_instance()?;
        let access = self.access(&object);

        // The key is authoritative for the identifier, not the record.
        access.set_identifier(key.clone())?;
        let id = access.identifier()?.unwrap_or_else(|| key.clone());

        // Registered before associations are resolved so that cycles back to
        // this object find it.
        session.register(self.entity.name(), id, &object)?;

        for property in self.entity.persistent_properties() {
            match &property.kind {
                PropertyKind::Simple(_) | PropertyKind::Identity(_) => {
                    let value = self.store.get_entry_value(entry, property.target_key());
                    access.set_scalar(&property.name, value)?;
                }
                PropertyKind::ToOne(to_one) => {
                    self.retrieve_to_one(session, &access, entry, property, to_one)?;
                }
                PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => {
                    self.retrieve_collection(session, &access, &key, property, c)?;
                }
                PropertyKind::Embedded(embedded) => {
                    let value = self.store.get_embedded(entry, property.target_key());
                    let object = match value {
                        Value::Map(map) => Some(self.decode_embedded(embedded, map)?),
                        _ => None,
                    };
                    access.set_property(&property.name, PropertyValue::Object(object))?;
                }
            }
        }

        trace!(entity = %self.entity.name(), key = %key, "materialized");
        Ok(object)
    }

    fn retrieve_to_one(
        &self,
        session: &Session,
        access: &EntityAccess<'_>,
        entry: &S::Entry,
        property: &Property,
        to_one: &ToOne,
    ) -> EngineResult<()> {
        if to_one.foreign_key_in_child || !to_one.association.is_owning_side() {
            return Ok(());
        }
        let target = session
            .context()
            .associated_entity(&self.entity, &property.name)?;
        let associated = match self.store.get_entry_value(entry, property.target_key()) {
            Value::Null => None,
            fk => session.retrieve(target.name(), fk)?,
        };
        access.set_property(&property.name, PropertyValue::Object(associated))?;
        Ok(())
    }

    fn retrieve_collection(
        &self,
        session: &Session,
        access: &EntityAccess<'_>,
        owner: &Value,
        property: &Property,
        collection: &CollectionAssociation,
    ) -> EngineResult<()> {
        // Resolved up front so an unknown target fails even for lazy collections.
        let indexer = self.association_indexer(session, property)?;

        let value = match collection.fetch_or(session.default_fetch()) {
            FetchStrategy::Lazy => {
                let loader = AssociationLoader {
                    session: session.downgrade(),
                    indexer,
                    owner: owner.clone(),
                };
                PersistentCollection::lazy(collection.collection, Arc::new(loader))
            }
            FetchStrategy::Eager => {
                let keys = indexer.query(owner)?;
                let children = session
                    .retrieve_all(indexer.indexed_entity(), &keys)?
                    .into_iter()
                    .flatten()
                    .collect();
                PersistentCollection::from_vec(collection.collection, children)
            }
        };
        access.set_property(&property.name, PropertyValue::Collection(value))?;
        Ok(())
    }

    fn decode_embedded(
        &self,
        embedded: &EmbeddedType,
        mut map: BTreeMap<String, Value>,
    ) -> EngineResult<ObjectRef> {
        let factory = embedded
            .factory
            .as_ref()
            .ok_or_else(|| ModelError::NoInstanceFactory {
                entity: embedded.type_name.clone(),
            })?;
        let object = factory();
        for property in &embedded.properties {
            let raw = map.remove(property.target_key()).unwrap_or_default();
            let value = match &property.kind {
                PropertyKind::Simple(t) => {
                    PropertyValue::Scalar(self.conversions.convert_owned(raw, *t)?)
                }
                PropertyKind::Identity(id) => {
                    PropertyValue::Scalar(self.conversions.convert_owned(raw, id.value_type)?)
                }
                PropertyKind::Embedded(inner) => PropertyValue::Object(match raw {
                    Value::Map(m) => Some(self.decode_embedded(inner, m)?),
                    _ => None,
                }),
                _ => continue,
            };
            let mut guard = object
                .write()
                .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
            guard
                .set_property(&property.name, value)
                .map_err(|source| ModelError::Access {
                    entity: embedded.type_name.clone(),
                    source,
                })?;
        }
        Ok(object)
    }

    /// Indexed simple and to-one properties that the backend keeps a
    /// value index for.
    fn property_indexers(&self) -> Vec<(&Property, Arc<dyn PropertyValueIndexer>)> {
        self.entity
            .persistent_properties()
            .iter()
            .filter(|p| {
                p.is_indexed() && matches!(p.kind, PropertyKind::Simple(_) | PropertyKind::ToOne(_))
            })
            .filter_map(|p| {
                self.store
                    .property_indexer(&self.entity, p)
                    .map(|indexer| (p, indexer))
            })
            .collect()
    }

    /// The indexed form of `property` as stored in `entry`.
    fn stored_index_value(&self, entry: &S::Entry, property: &Property) -> EngineResult<Value> {
        let raw = self.store.get_entry_value(entry, property.target_key());
        Ok(self.conversions.convert_owned(raw, property.value_type())?)
    }

    /// Values indexed for the record under `native` that `current` no
    /// longer holds.
    fn stale_index_values(
        &self,
        native: &S::Key,
        current: &[(&Property, Value)],
    ) -> EngineResult<Vec<(Arc<dyn PropertyValueIndexer>, Value)>> {
        let indexers = self.property_indexers();
        if indexers.is_empty() {
            return Ok(Vec::new());
        }
        let Some(previous) = self
            .store
            .retrieve_entry(&self.entity, self.family(), native)?
        else {
            return Ok(Vec::new());
        };
        let mut stale = Vec::new();
        for (property, indexer) in indexers {
            let old = self.stored_index_value(&previous, property)?;
            let kept = current
                .iter()
                .any(|(p, v)| p.name == property.name && *v == old);
            if !old.is_null() && !kept {
                stale.push((indexer, old));
            }
        }
        Ok(stale)
    }

    // ---------------------------------------------------------------
    // Persist
    // ---------------------------------------------------------------

    fn encode_embedded(&self, embedded: &EmbeddedType, object: &ObjectRef) -> EngineResult<Value> {
        let mut map = BTreeMap::new();
        for property in &embedded.properties {
            let current = {
                let guard = object
                    .read()
                    .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
                guard.get_property(&property.name)
            };
            let value = match (&property.kind, current) {
                (PropertyKind::Simple(_) | PropertyKind::Identity(_), Some(PropertyValue::Scalar(v))) => v,
                (PropertyKind::Embedded(inner), Some(PropertyValue::Object(Some(o)))) => {
                    self.encode_embedded(inner, &o)?
                }
                _ => Value::Null,
            };
            map.insert(property.target_key().to_string(), value);
        }
        Ok(Value::Map(map))
    }

    /// Handle a to-one association while filling `entry`; returns the
    /// foreign key written, if any.
    fn persist_to_one(
        &self,
        session: &Session,
        access: &EntityAccess<'_>,
        entry: &mut S::Entry,
        property: &Property,
        to_one: &ToOne,
    ) -> EngineResult<Option<Value>> {
        if to_one.foreign_key_in_child || !to_one.association.is_owning_side() {
            return Ok(None);
        }
        let associated = access.get_object(&property.name)?;
        let fk = match &associated {
            Some(child) if to_one.association.cascades_save() => Some(session.persist(child)?),
            Some(child) => session.identifier_of(child)?,
            None => None,
        };
        match fk {
            Some(fk) => {
                self.store
                    .set_entry_value(entry, property.target_key(), fk.clone());
                Ok(Some(fk))
            }
            None if !property.mapping.nullable => Err(EngineError::NullAssociation {
                entity: self.entity.name().to_string(),
                property: property.name.clone(),
            }),
            None => Ok(None),
        }
    }

    /// Persist or collect the children of a collection association and
    /// record them against `owner`.
    fn persist_collection(
        &self,
        session: &Session,
        access: &EntityAccess<'_>,
        owner: &Value,
        property: &Property,
        collection: &CollectionAssociation,
    ) -> EngineResult<()> {
        if !collection.association.is_owning_side() {
            return Ok(());
        }
        let Some(value) = access.get_collection(&property.name)? else {
            return Ok(());
        };
        // An untouched lazy collection has nothing new to write.
        let Some(children) = value.loaded_elements()? else {
            trace!(
                entity = %self.entity.name(),
                property = %property.name,
                "skipping uninitialized collection"
            );
            return Ok(());
        };

        let mut keys = Vec::with_capacity(children.len());
        for child in &children {
            let key = if collection.association.cascades_save() {
                Some(session.persist(child)?)
            } else {
                session.identifier_of(child)?
            };
            keys.extend(key);
        }

        if !keys.is_empty() {
            let indexer = self.association_indexer(session, property)?;
            indexer.index(owner, &keys)?;
            debug!(
                entity = %self.entity.name(),
                property = %property.name,
                owner = %owner,
                children = keys.len(),
                "indexed association"
            );
        }
        value.reset_dirty();
        Ok(())
    }

    fn persist_object(&self, session: &Session, object: &ObjectRef) -> EngineResult<Value> {
        let access = self.access(object);
        let mut entry = self.store.create_new_entry(self.family());
        let mut indexed: Vec<(&Property, Value)> = Vec::new();
        let mut deferred: Vec<(&Property, &CollectionAssociation)> = Vec::new();

        for property in self.entity.persistent_properties() {
            match &property.kind {
                PropertyKind::Simple(_) | PropertyKind::Identity(_) => {
                    let value = access.get_scalar(&property.name)?;
                    if property.is_indexed() && !value.is_null() {
                        indexed.push((property, value.clone()));
                    }
                    self.store
                        .set_entry_value(&mut entry, property.target_key(), value);
                }
                PropertyKind::ToOne(to_one) => {
                    let fk = self.persist_to_one(session, &access, &mut entry, property, to_one)?;
                    if let Some(fk) = fk.filter(|_| property.is_indexed()) {
                        indexed.push((property, fk));
                    }
                }
                PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c) => {
                    deferred.push((property, c));
                }
                PropertyKind::Embedded(embedded) => {
                    if let Some(value) = access.get_object(&property.name)? {
                        let encoded = self.encode_embedded(embedded, &value)?;
                        self.store
                            .set_embedded(&mut entry, property.target_key(), encoded);
                    }
                }
            }
        }

        let (id, owner) = match access.identifier()? {
            None => {
                if !session.allow_insert(&self.entity, object) {
                    return Err(EngineError::PersistVetoed {
                        entity: self.entity.name().to_string(),
                    });
                }
                let native = self.store.store_entry(&self.entity, entry)?;
                let owner = native.to_value();
                access.set_identifier(owner.clone())?;
                let id = access.identifier()?.unwrap_or_else(|| owner.clone());
                debug!(entity = %self.entity.name(), key = %owner, "inserted");
                (id, owner)
            }
            Some(id) => {
                if !session.allow_update(&self.entity, object) {
                    debug!(entity = %self.entity.name(), key = %id, "update vetoed");
                    return Ok(id);
                }
                let native = self.store.infer_native_key(self.family(), &id)?;
                let stale = self.stale_index_values(&native, &indexed)?;
                self.store.update_entry(&self.entity, &native, entry)?;
                let owner = native.to_value();
                for (indexer, old) in stale {
                    indexer.deindex(&old, &owner)?;
                }
                debug!(entity = %self.entity.name(), key = %id, "updated");
                (id, owner)
            }
        };
        session.register(self.entity.name(), id.clone(), object)?;

        for (property, value) in indexed {
            if let Some(indexer) = self.store.property_indexer(&self.entity, property) {
                indexer.index(&value, &owner)?;
            }
        }

        for (property, collection) in deferred {
            self.persist_collection(session, &access, &owner, property, collection)?;
        }

        Ok(id)
    }
}

impl<S: NativeEntryStore> Persister for KeyValueEntityPersister<S> {
    fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    fn persist(&self, session: &Session, object: &ObjectRef) -> EngineResult<Value> {
        let Some(_guard) = session.mark_in_flight(object)? else {
            // Reached again through a cascade while its own persist runs.
            return self
                .object_identifier(object)?
                .ok_or_else(|| EngineError::CircularCascade {
                    entity: self.entity.name().to_string(),
                });
        };
        self.persist_object(session, object)
    }

    fn retrieve(&self, session: &Session, key: &Value) -> EngineResult<Option<ObjectRef>> {
        let native = self.store.infer_native_key(self.family(), key)?;
        match self.store.retrieve_entry(&self.entity, self.family(), &native)? {
            Some(entry) => self.materialize(session, &native, &entry).map(Some),
            None => {
                debug!(entity = %self.entity.name(), key = %key, "not found");
                Ok(None)
            }
        }
    }

    fn retrieve_all(
        &self,
        session: &Session,
        keys: &[Value],
    ) -> EngineResult<Vec<Option<ObjectRef>>> {
        let natives = keys
            .iter()
            .map(|k| self.store.infer_native_key(self.family(), k))
            .collect::<EngineResult<Vec<_>>>()?;
        let entries = self
            .store
            .retrieve_entries(&self.entity, self.family(), &natives)?;

        let mut out = Vec::with_capacity(keys.len());
        for ((key, native), entry) in keys.iter().zip(&natives).zip(entries) {
            // An earlier element of the batch may already have loaded this one.
            if let Some(cached) = session.cached(self.entity.name(), key)? {
                out.push(Some(cached));
                continue;
            }
            out.push(match entry {
                Some(entry) => Some(self.materialize(session, native, &entry)?),
                None => None,
            });
        }
        Ok(out)
    }

    fn delete(&self, session: &Session, objects: &[ObjectRef]) -> EngineResult<()> {
        let mut ids = Vec::with_capacity(objects.len());
        let mut natives = Vec::with_capacity(objects.len());
        let mut before: Vec<ObjectRef> = Vec::new();
        let mut after: Vec<ObjectRef> = Vec::new();

        for object in objects {
            let access = self.access(object);
            let Some(id) = access.identifier()? else {
                debug!(entity = %self.entity.name(), "skipping delete of unsaved object");
                continue;
            };
            for property in self.entity.persistent_properties() {
                match &property.kind {
                    PropertyKind::OneToMany(c) | PropertyKind::ManyToMany(c)
                        if c.association.cascades_delete() =>
                    {
                        if let Some(children) = access.get_collection(&property.name)? {
                            before.extend(children.to_vec()?);
                        }
                    }
                    PropertyKind::ToOne(t) if t.association.cascades_delete() => {
                        after.extend(access.get_object(&property.name)?);
                    }
                    _ => {}
                }
            }
            natives.push(self.store.infer_native_key(self.family(), &id)?);
            ids.push(id);
        }

        if !before.is_empty() {
            session.delete(&before)?;
        }
        if !natives.is_empty() {
            // Indexed values come from the stored records, not the possibly
            // modified objects.
            let indexers = self.property_indexers();
            let stored = if indexers.is_empty() {
                Vec::new()
            } else {
                self.store
                    .retrieve_entries(&self.entity, self.family(), &natives)?
            };
            self.store.delete_entries(self.family(), &natives)?;
            for (native, entry) in natives.iter().zip(stored) {
                let Some(entry) = entry else { continue };
                let owner = native.to_value();
                for (property, indexer) in &indexers {
                    let old = self.stored_index_value(&entry, property)?;
                    if !old.is_null() {
                        indexer.deindex(&old, &owner)?;
                    }
                }
            }
            debug!(entity = %self.entity.name(), count = natives.len(), "deleted");
        }
        for id in &ids {
            session.evict_key(self.entity.name(), id)?;
        }
        if !after.is_empty() {
            session.delete(&after)?;
        }
        Ok(())
    }

    fn query_by_property(
        &self,
        property: &str,
        value: &Value,
        offset: usize,
        max: Option<usize>,
    ) -> EngineResult<Vec<Value>> {
        let prop = self.entity.require_property(property)?;
        let indexer = self
            .store
            .property_indexer(&self.entity, prop)
            .filter(|_| prop.is_indexed())
            .ok_or_else(|| EngineError::MissingPropertyIndexer {
                entity: self.entity.name().to_string(),
                property: property.to_string(),
            })?;
        let value = self.conversions.convert(value, prop.value_type())?;
        indexer.query_range(&value, offset, max)
    }

    fn object_identifier(&self, object: &ObjectRef) -> EngineResult<Option<Value>> {
        Ok(self.access(object).identifier()?)
    }
}

/// Loads a lazy association collection through the session it came from.
struct AssociationLoader {
    session: Weak<SessionInner>,
    indexer: Arc<dyn AssociationIndexer>,
    owner: Value,
}

impl CollectionLoader for AssociationLoader {
    fn load(&self) -> CollectionResult<Vec<ObjectRef>> {
        let session = Session::upgrade(&self.session).ok_or(CollectionError::Detached)?;
        if !session.is_connected() {
            return Err(CollectionError::Detached);
        }
        let keys = self.indexer.query(&self.owner).map_err(CollectionError::load)?;
        trace!(
            entity = %self.indexer.indexed_entity(),
            owner = %self.owner,
            children = keys.len(),
            "loading lazy collection"
        );
        let children = session
            .retrieve_all(self.indexer.indexed_entity(), &keys)
            .map_err(CollectionError::load)?;
        Ok(children.into_iter().flatten().collect())
    }
}
