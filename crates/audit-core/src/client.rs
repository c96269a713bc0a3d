use std::future::Future;
use std::pin::Pin;

use audit_value::Value;

use crate::error::AuditError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The per-model operations a database client delegate exposes, per
/// spec.md §6.2. `args`/results are [`Value`] rather than a concrete query
/// DSL because the concrete ORM binding (and its query-builder types) is an
/// external collaborator this crate never constructs, only calls into.
#[async_trait::async_trait]
pub trait ModelDelegate: Send + Sync {
    async fn find_unique(&self, args: Value) -> Result<Option<Value>, AuditError>;
    async fn find_many(&self, args: Value) -> Result<Vec<Value>, AuditError>;
}

/// A dynamic `modelDelegate` mapping plus `$transaction`, per spec.md §6.2.
/// Within a transaction the same shape is exposed by the transactional
/// handle passed into `transaction`'s callback — callers don't need a
/// separate "transactional client" type.
#[async_trait::async_trait]
pub trait DbClient: Send + Sync {
    fn delegate(&self, model: &str) -> Option<&dyn ModelDelegate>;

    /// Runs `work` against a transaction-scoped view of this client. The
    /// transaction commits if `work` returns `Ok`, rolls back otherwise.
    /// Implementations enlist nested calls onto an already-open user
    /// transaction rather than opening a second one (spec.md §5).
    async fn transaction<'a>(
        &'a self,
        work: Box<dyn FnOnce(&'a dyn DbClient) -> BoxFuture<'a, Result<(), AuditError>> + Send + 'a>,
    ) -> Result<(), AuditError>;
}
