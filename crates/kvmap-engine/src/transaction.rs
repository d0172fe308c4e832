use crate::error::EngineResult;

/// A backend transaction handed out by [`Backend::begin_transaction`](crate::Backend::begin_transaction).
///
/// After `commit` or `rollback` succeeds the transaction is no longer active.
pub trait Transaction: Send + Sync {
    fn commit(&self) -> EngineResult<()>;

    fn rollback(&self) -> EngineResult<()>;

    fn is_active(&self) -> bool;
}
