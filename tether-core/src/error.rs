use crate::ContextKey;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the pool, the registry and the transaction coordinator.
///
/// They travel inside [`crate::Error`] like any other error, use
/// `error.downcast_ref::<TransactionError>()` to classify them.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No connection became available within the acquire timeout.
    #[error("No connection available within {timeout:?}, the pool is exhausted")]
    PoolExhausted { timeout: Duration },

    /// The pool was closed while (or before) waiting for a connection.
    #[error("The connection pool is closed")]
    PoolClosed,

    /// The driver reported the connection as unusable.
    #[error("Connection {connection} is broken: {reason}")]
    ConnectionBroken { connection: u64, reason: String },

    /// The current continuation carries a context key that resolves to no open transaction.
    #[error("Context {key} is not bound to an open transaction, the continuation escaped its block")]
    ContextPropagationFailure { key: ContextKey },

    /// The key is already bound in the registry.
    #[error("Context {key} is already bound")]
    ContextAlreadyBound { key: ContextKey },

    /// The transactional block did not settle within the configured bound.
    #[error("The transaction did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    /// A nested block failed, the outer block returned success anyway.
    #[error("The transaction was marked rollback only by a failed nested block")]
    RollbackOnly,
}

impl TransactionError {
    /// Matches the kind of `error` when it carries a `TransactionError`.
    pub fn of(error: &crate::Error) -> Option<&TransactionError> {
        error.downcast_ref::<TransactionError>()
    }
}
