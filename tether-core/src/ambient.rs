//! Continuation-local propagation of the current transaction.
//!
//! The key of the open transaction lives in a tokio task-local. Whatever is
//! polled inside [`scope`] sees it: the block itself, the futures it awaits,
//! joins or selects, across any number of timer or I/O suspensions. A plain
//! `tokio::spawn` starts a new causal root and sees nothing; [`spawn`] and
//! [`propagate`] capture the key at the point the work is scheduled and
//! restore it every time that work is polled.
//!
//! # Work that escapes the transaction
//!
//! Statements issued from a task started with a plain `tokio::spawn` (or
//! `std::thread::spawn`, or any future polled outside the block without going
//! through [`propagate`]) are **not** part of the transaction. They lease
//! another connection and run in autocommit: they are committed even when the
//! block later fails, they do not see the transaction's uncommitted writes and
//! they may wait on its locks. Nothing reports the mistake, the statements
//! simply succeed elsewhere. Work that must land in the transaction has to be
//! started with [`spawn`] or wrapped with [`propagate`], and has to finish
//! before the block returns.
//!
//! ```ignore
//! db.transaction(|| async move {
//!     // Inside the transaction, on its connection
//!     let inside = ambient::spawn(work(db.clone()));
//!     // Outside of it, committed on its own whatever the block does
//!     let outside = tokio::spawn(work(db.clone()));
//!     inside.await??;
//!     Ok(())
//! })
//! ```

use crate::ContextKey;
use std::future::Future;
use tokio::task::{JoinHandle, futures::TaskLocalFuture};

tokio::task_local! {
    static CURRENT: Option<ContextKey>;
}

/// Key of the transaction the running continuation belongs to.
pub fn current() -> Option<ContextKey> {
    CURRENT.try_with(|key| *key).ok().flatten()
}

/// Run `future` with `key` installed as the ambient context.
pub fn scope<F: Future>(
    key: Option<ContextKey>,
    future: F,
) -> TaskLocalFuture<Option<ContextKey>, F> {
    CURRENT.scope(key, future)
}

/// Bind `future` to the ambient context of the caller.
///
/// The snapshot is taken now, so the returned future keeps the caller's
/// context (or the absence of one) wherever it is eventually polled.
pub fn propagate<F: Future>(future: F) -> TaskLocalFuture<Option<ContextKey>, F> {
    CURRENT.scope(current(), future)
}

/// Spawn `future` on the runtime as a continuation of the caller.
///
/// Use this instead of `tokio::spawn` for anything that issues statements on
/// behalf of an open transaction, see the [module docs](self).
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn outside_any_scope() {
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn survives_timers() {
        let key = ContextKey::next();
        scope(Some(key), async {
            assert_eq!(current(), Some(key));
            sleep(Duration::from_millis(2)).await;
            assert_eq!(current(), Some(key));
            let deferred = async {
                sleep(Duration::from_millis(1)).await;
                current()
            };
            assert_eq!(deferred.await, Some(key));
        })
        .await;
        assert_eq!(current(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_inherits_and_tokio_spawn_does_not() {
        let key = ContextKey::next();
        scope(Some(key), async {
            let inherited = spawn(async {
                sleep(Duration::from_millis(2)).await;
                current()
            });
            let detached = tokio::spawn(async { current() });
            assert_eq!(inherited.await.expect("Task panicked"), Some(key));
            assert_eq!(detached.await.expect("Task panicked"), None);
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_scopes_stay_apart() {
        let a = ContextKey::next();
        let b = ContextKey::next();
        let observe = |key| {
            scope(Some(key), async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                    seen.push(current());
                }
                seen
            })
        };
        let (seen_a, seen_b) = tokio::join!(observe(a), observe(b));
        assert!(seen_a.iter().all(|v| *v == Some(a)));
        assert!(seen_b.iter().all(|v| *v == Some(b)));
    }

    #[tokio::test]
    async fn propagate_snapshots_at_creation() {
        let key = ContextKey::next();
        let outside = propagate(async { current() });
        let inside = scope(Some(key), async { propagate(async { current() }) }).await;
        let (outside, inside) = scope(Some(ContextKey::next()), async {
            (outside.await, inside.await)
        })
        .await;
        assert_eq!(outside, None);
        assert_eq!(inside, Some(key));
    }
}
