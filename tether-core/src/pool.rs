use crate::{
    Connection, Driver, Error, Executor, QueryResult, Result, TransactionError,
    future::{self, Either},
    stream::{self, Stream},
};
use std::{
    borrow::Cow,
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;

/// Connection pool and transaction configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of physical connections (idle + leased).
    pub max_connections: usize,
    /// Maximum time to wait for a connection, `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Maximum time a transactional block may run before it is rolled back.
    pub transaction_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Some(Duration::from_secs(30)),
            transaction_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set max connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.acquire_timeout = timeout.into();
        self
    }

    /// Set transaction timeout.
    pub fn transaction_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.transaction_timeout = timeout.into();
        self
    }
}

/// Identifies a pool for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Snapshot of the pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Physical connections currently open (idle + leased).
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
    /// Callers suspended in `acquire`.
    pub waiting: usize,
}

/// Bounded pool of connections for one driver and URL.
///
/// Connections are opened lazily on demand. Waiters are served in FIFO order
/// (tokio's semaphore is fair), each permit standing for one leased connection.
pub struct Pool<D: Driver> {
    shared: Arc<Shared<D>>,
}

struct Shared<D: Driver> {
    id: PoolId,
    driver: D,
    url: Cow<'static, str>,
    config: PoolConfig,
    permits: Semaphore,
    idle: Mutex<VecDeque<(u64, D::Connection)>>,
    open: AtomicUsize,
    waiting: AtomicUsize,
    next_connection: AtomicU64,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Driver> fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("driver", &D::NAME)
            .field("status", &self.status())
            .finish()
    }
}

impl<D: Driver> Pool<D> {
    pub fn new(driver: D, url: impl Into<Cow<'static, str>>, mut config: PoolConfig) -> Self {
        if config.max_connections == 0 {
            log::warn!("A pool needs at least one connection, max_connections set to 1");
            config.max_connections = 1;
        }
        Self {
            shared: Arc::new(Shared {
                id: PoolId::next(),
                driver,
                url: url.into(),
                permits: Semaphore::new(config.max_connections),
                config,
                idle: Default::default(),
                open: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> PoolId {
        self.shared.id
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.shared.idle().len();
        let open = self.shared.open.load(Ordering::Relaxed);
        PoolStatus {
            capacity: self.shared.config.max_connections,
            open,
            idle,
            leased: open.saturating_sub(idle),
            waiting: self.shared.waiting.load(Ordering::Relaxed),
        }
    }

    /// Lease a connection, waiting in line when the pool is at capacity.
    pub async fn acquire(&self) -> Result<PooledConnection<D>> {
        let shared = &self.shared;
        let permit = {
            let _waiting = Waiting::new(&shared.waiting);
            let acquire = shared.permits.acquire();
            match shared.config.acquire_timeout {
                Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                    let error = Error::new(TransactionError::PoolExhausted { timeout });
                    log::warn!("{:#}", error);
                    error
                })?,
                None => acquire.await,
            }
        }
        .map_err(|_| Error::new(TransactionError::PoolClosed))?;
        loop {
            let Some((id, connection)) = shared.idle().pop_back() else {
                break;
            };
            if connection.is_broken() {
                log::warn!("Idle connection {} is broken, discarding it", id);
                shared.discard(connection);
                continue;
            }
            permit.forget();
            log::trace!("Leased idle connection {}", id);
            return Ok(PooledConnection::new(id, connection, shared.clone()));
        }
        let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
        let connection = shared
            .driver
            .connect(shared.url.clone())
            .await
            .map_err(|e| {
                let error = e.context(format!(
                    "Could not open a new {} connection to `{}`",
                    D::NAME,
                    shared.url
                ));
                log::error!("{:#}", error);
                error
            })?;
        shared.open.fetch_add(1, Ordering::Relaxed);
        permit.forget();
        log::debug!("Opened connection {} ({})", id, D::NAME);
        Ok(PooledConnection::new(id, connection, shared.clone()))
    }

    /// Give a leased connection back, waking the next waiter.
    pub fn release(&self, connection: PooledConnection<D>) {
        if connection.pool.id != self.shared.id {
            log::error!(
                "Connection {} does not belong to this pool, returning it to its own",
                connection.id
            );
        }
        connection.release();
    }

    /// Refuse new leases and close the idle connections.
    pub fn close(&self) {
        self.shared.permits.close();
        let idle = std::mem::take(&mut *self.shared.idle());
        for (_, connection) in idle {
            self.shared.discard(connection);
        }
        log::debug!("Pool {:?} closed", self.shared.id);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }
}

impl<D: Driver> Shared<D> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<(u64, D::Connection)>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard(&self, connection: D::Connection) {
        drop(connection);
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A connection leased from a [`Pool`].
///
/// Releasing consumes the lease. A lease dropped without release goes back to
/// the pool as well, unless it is broken or still inside a transaction, in
/// which case the physical connection is closed and its capacity freed.
pub struct PooledConnection<D: Driver> {
    id: u64,
    connection: Option<D::Connection>,
    in_transaction: bool,
    pool: Arc<Shared<D>>,
}

impl<D: Driver> PooledConnection<D> {
    fn new(id: u64, connection: D::Connection, pool: Arc<Shared<D>>) -> Self {
        Self {
            id,
            connection: Some(connection),
            in_transaction: false,
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    pub fn is_broken(&self) -> bool {
        self.connection.as_ref().map_or(true, Connection::is_broken)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, value: bool) {
        self.in_transaction = value;
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let pool = &self.pool;
        if connection.is_broken() {
            log::warn!("Connection {} is broken, discarding it", self.id);
            pool.discard(connection);
        } else if self.in_transaction {
            log::warn!(
                "Connection {} was given back inside a transaction, discarding it",
                self.id
            );
            pool.discard(connection);
        } else if pool.permits.is_closed() {
            pool.discard(connection);
        } else {
            log::trace!("Connection {} back to the idle set", self.id);
            pool.idle().push_back((self.id, connection));
        }
        pool.permits.add_permits(1);
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl<D: Driver> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.id)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl<D: Driver> Executor for PooledConnection<D> {
    type Driver = D;

    fn run<'s>(
        &'s mut self,
        query: String,
    ) -> impl Stream<Item = Result<QueryResult>> + Send + 's {
        let id = self.id;
        match self.connection.as_mut() {
            Some(connection) => Either::Left(connection.run(query)),
            None => Either::Right(stream::once(future::ready(Err(Error::new(
                TransactionError::ConnectionBroken {
                    connection: id,
                    reason: "the connection was already released".into(),
                },
            ))))),
        }
    }
}
