//! Task-scoped ambient transaction.
//!
//! Sinks may report a transaction as "ambient" so that a freshly created
//! facade can adopt it in `init_current_transaction` instead of opening a
//! new one. The ambient value lives in a tokio task-local and is only set
//! for the duration of [`scope`] / [`sync_scope`]; there is no process-wide
//! current transaction.

use std::future::Future;

use crate::sink::TransactionId;

tokio::task_local! {
    static AMBIENT_TRANSACTION: TransactionId;
}

/// Run `fut` with `transaction` as the ambient transaction.
pub async fn scope<F>(transaction: TransactionId, fut: F) -> F::Output
where
    F: Future,
{
    AMBIENT_TRANSACTION.scope(transaction, fut).await
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<R>(transaction: TransactionId, f: impl FnOnce() -> R) -> R {
    AMBIENT_TRANSACTION.sync_scope(transaction, f)
}

/// Ambient transaction of the calling task, if inside a scope.
pub fn current() -> Option<TransactionId> {
    AMBIENT_TRANSACTION.try_with(|id| *id).ok()
}
