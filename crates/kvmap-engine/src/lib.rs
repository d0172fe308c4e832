//! Generic key-value persistence engine for kvmap.
//!
//! A [`Datastore`] pairs a [`MappingContext`](kvmap_model::MappingContext)
//! with a [`Backend`]. Sessions opened from it persist, retrieve, and delete
//! object graphs through per-entity [`Persister`]s. The stock persister,
//! [`KeyValueEntityPersister`], drives any [`NativeEntryStore`]: a backend
//! only supplies record and key handling plus association indexes.
//!
//! # Key Types
//!
//! - [`Datastore`] / [`Backend`] - connection factory and backend seam
//! - [`Session`] - unit of work with an identity map, interceptors, and transactions
//! - [`KeyValueEntityPersister`] - object graph to native record translation
//! - [`NativeEntryStore`] - hooks a key-value backend implements
//! - [`AssociationIndexer`] / [`PropertyValueIndexer`] - secondary indexes
//! - [`InMemoryBackend`] - reference backend with a call log for tests
//! - [`DatastoreConfig`] - TOML-loadable datastore settings

pub mod config;
pub mod datastore;
pub mod error;
pub mod indexer;
pub mod interceptor;
pub mod key;
pub mod memory;
pub mod persister;
pub mod session;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod fixtures;

pub use config::DatastoreConfig;
pub use datastore::{Backend, Datastore};
pub use error::{EngineError, EngineResult};
pub use indexer::{AssociationIndexer, Indexer, PropertyValueIndexer};
pub use interceptor::EntityInterceptor;
pub use key::NativeKey;
pub use memory::{BackendCall, InMemoryBackend, InMemoryStore, Record};
pub use persister::{KeyValueEntityPersister, Persister};
pub use session::Session;
pub use store::NativeEntryStore;
pub use transaction::Transaction;
