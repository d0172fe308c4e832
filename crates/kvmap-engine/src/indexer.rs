//! Backend indexes for associations and property-value lookups.
//!
//! Keys crossing these traits are [`Value`]s: the
//! [`to_value`](crate::NativeKey::to_value) form of the backend's native keys.

use kvmap_types::Value;

use crate::error::EngineResult;

/// Owner key to child keys membership.
///
/// Implementations must satisfy:
/// - `index` is idempotent: indexing a pair already present adds nothing.
/// - `query` returns each child key at most once, in first-indexed order.
/// - `query` of an owner that was never indexed returns an empty list.
pub trait Indexer: Send + Sync {
    /// Record `children` as members of `owner`.
    fn index(&self, owner: &Value, children: &[Value]) -> EngineResult<()>;

    /// Child keys recorded for `owner`.
    fn query(&self, owner: &Value) -> EngineResult<Vec<Value>>;
}

/// An [`Indexer`] for one collection association.
pub trait AssociationIndexer: Indexer {
    /// Name of the entity the child keys belong to.
    fn indexed_entity(&self) -> &str;
}

/// Secondary index for equality lookups on a non-identifier property.
pub trait PropertyValueIndexer: Send + Sync {
    /// Record that `owner` holds `value`. Idempotent.
    fn index(&self, value: &Value, owner: &Value) -> EngineResult<()>;

    /// Forget that `owner` holds `value`. A pair that is not indexed is a no-op.
    fn deindex(&self, value: &Value, owner: &Value) -> EngineResult<()>;

    /// Owner keys holding `value`, skipping `offset` and returning at most
    /// `max` keys.
    fn query_range(
        &self,
        value: &Value,
        offset: usize,
        max: Option<usize>,
    ) -> EngineResult<Vec<Value>>;

    /// All owner keys holding `value`.
    fn query(&self, value: &Value) -> EngineResult<Vec<Value>> {
        self.query_range(value, 0, None)
    }
}
