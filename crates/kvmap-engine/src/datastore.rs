//! The datastore: connection factory and process-wide persister registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use kvmap_model::{Entity, MappingContext};
use kvmap_types::ConversionService;
use tracing::debug;

use crate::config::DatastoreConfig;
use crate::error::{EngineError, EngineResult};
use crate::persister::Persister;
use crate::session::Session;
use crate::transaction::Transaction;

/// A storage backend: builds persisters and transactions.
pub trait Backend: Send + Sync {
    /// Short name for logs, e.g. `"memory"`.
    fn name(&self) -> &str;

    /// Create the persister for `entity`.
    fn create_persister(
        &self,
        entity: Arc<Entity>,
        conversions: Arc<ConversionService>,
    ) -> EngineResult<Arc<dyn Persister>>;

    /// Start a transaction.
    fn begin_transaction(&self) -> EngineResult<Box<dyn Transaction>>;
}

/// Shared entry point for a mapping context over one backend.
///
/// Persisters are created once per entity and shared by every session;
/// creation is safe under concurrent first use.
pub struct Datastore {
    context: Arc<MappingContext>,
    backend: Arc<dyn Backend>,
    conversions: Arc<ConversionService>,
    config: DatastoreConfig,
    persisters: RwLock<HashMap<String, Arc<dyn Persister>>>,
}

impl Datastore {
    pub fn new(context: Arc<MappingContext>, backend: Arc<dyn Backend>) -> Self {
        Self {
            context,
            backend,
            conversions: Arc::new(ConversionService::default()),
            config: DatastoreConfig::default(),
            persisters: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: DatastoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_conversions(mut self, conversions: ConversionService) -> Self {
        self.conversions = Arc::new(conversions);
        self
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn conversions(&self) -> &Arc<ConversionService> {
        &self.conversions
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// Open a session. `details` override the configured connection defaults.
    pub fn connect(self: &Arc<Self>, details: BTreeMap<String, String>) -> Session {
        let details = self.config.merged_connection(details);
        debug!(backend = %self.backend.name(), details = ?details, "session connected");
        Session::open(Arc::clone(self), details)
    }

    /// Run `f` in a fresh session that is disconnected afterwards, whether
    /// `f` succeeds or not.
    pub fn with_session<R, F>(self: &Arc<Self>, details: BTreeMap<String, String>, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Session) -> EngineResult<R>,
    {
        let session = self.connect(details);
        let result = f(&session);
        let closed = session.disconnect();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// The shared persister for entity `name`, created on first use.
    ///
    /// A cached persister is only reused while its entity is the one the
    /// context currently holds, so re-adding an entity yields a new persister.
    pub fn persister(&self, name: &str) -> EngineResult<Arc<dyn Persister>> {
        let entity = self
            .context
            .persistent_entity(name)?
            .ok_or_else(|| EngineError::NonPersistentType {
                name: name.to_string(),
            })?;
        let current = |p: &&Arc<dyn Persister>| Arc::ptr_eq(p.entity(), &entity);

        if let Some(p) = self
            .persisters
            .read()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))?
            .get(name)
            .filter(current)
        {
            return Ok(Arc::clone(p));
        }

        let mut persisters = self
            .persisters
            .write()
            .map_err(|e| EngineError::LockPoisoned(e.to_string()))?;
        // Another session may have created it between the two locks.
        if let Some(p) = persisters.get(name).filter(current) {
            return Ok(Arc::clone(p));
        }
        let persister = self
            .backend
            .create_persister(entity, Arc::clone(&self.conversions))?;
        debug!(entity = %name, backend = %self.backend.name(), "created persister");
        persisters.insert(name.to_string(), Arc::clone(&persister));
        Ok(persister)
    }
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("backend", &self.backend.name())
            .field("context", &self.context)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn persisters_are_shared() {
        let (datastore, _store) = datastore();
        let a = datastore.persister(AUTHOR).unwrap();
        let b = datastore.persister(AUTHOR).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.entity().name(), AUTHOR);
        assert!(matches!(
            datastore.persister("test.Nope"),
            Err(EngineError::NonPersistentType { .. })
        ));
    }

    #[test]
    fn connect_layers_details_over_config() {
        let mut config = DatastoreConfig::default();
        config.connection.insert("host".into(), "localhost".into());
        config.connection.insert("port".into(), "6379".into());
        let (datastore, _store) = datastore_with(context_with(author_declaration(None)), config);

        let session = datastore.connect(BTreeMap::from([("port".to_string(), "7000".to_string())]));
        assert_eq!(session.details()["host"], "localhost");
        assert_eq!(session.details()["port"], "7000");
        assert!(format!("{datastore:?}").contains("memory"));
    }

    #[test]
    fn with_session_disconnects_on_error() {
        let (datastore, _store) = datastore();
        let mut kept = None;
        let result: EngineResult<()> = datastore.with_session(BTreeMap::new(), |s| {
            kept = Some(s.clone());
            Err(EngineError::NoTransaction)
        });
        assert!(matches!(result, Err(EngineError::NoTransaction)));
        assert!(!kept.unwrap().is_connected());
    }

    #[test]
    fn concurrent_first_use_shares_one_persister() {
        let (datastore, _store) = datastore();
        let start = std::sync::Barrier::new(8);
        let persisters: Vec<Arc<dyn Persister>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        datastore.persister(AUTHOR).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let first = &persisters[0];
        assert!(persisters.iter().all(|p| Arc::ptr_eq(p, first)));
        assert!(Arc::ptr_eq(first, &datastore.persister(AUTHOR).unwrap()));
    }

    #[test]
    fn persister_follows_replaced_entity() {
        let (datastore, _store) = datastore();
        let before = datastore.persister(AUTHOR).unwrap();
        let replaced = datastore.context().add_persistent_entity(AUTHOR).unwrap();

        let after = datastore.persister(AUTHOR).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(after.entity(), &replaced));
        assert!(Arc::ptr_eq(&after, &datastore.persister(AUTHOR).unwrap()));
    }
}
