use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::{DbError, TaskRepository};

/// A repository bound to one open store transaction.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it back.
#[async_trait]
pub trait Transaction: TaskRepository {
    fn as_repository(&self) -> &dyn TaskRepository;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

#[async_trait]
pub trait TxManager: Send + Sync {
    /// Open a transaction. Transactions do not nest; on SQLite a second
    /// `begin` from inside an open unit of work waits forever.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;

    /// Release the connections behind this store. Later calls may fail.
    async fn close(&self) {}
}

/// Run `f` against a transaction-bound repository. Commits when `f`
/// succeeds, otherwise rolls back and returns `f`'s error. When the rollback
/// fails too, both errors are returned as [`DbError::Rollback`].
///
/// `f` must not call back into the store it was handed out of other than
/// through the repository argument.
pub async fn transact<M, T, F>(manager: &M, f: F) -> Result<T, DbError>
where
    M: TxManager + ?Sized,
    T: Send,
    F: for<'a> FnOnce(&'a dyn TaskRepository) -> BoxFuture<'a, Result<T, DbError>> + Send,
{
    let tx = manager.begin().await?;
    let result = f(tx.as_repository()).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(source) => match tx.rollback().await {
            Ok(()) => Err(source),
            Err(rollback) => {
                warn!("rollback failed after {source}: {rollback}");
                Err(DbError::Rollback {
                    source: Box::new(source),
                    rollback: Box::new(rollback),
                })
            }
        },
    }
}
