use crate::{
    ContextKey, ContextState, Driver, Error, Executor, LogicalContext, Pool, PoolConfig,
    PooledConnection, QueryResult, Registration, Result, RowLabeled, RowsAffected, SqlWriter,
    TransactionError, ambient, registry,
    stream::{Stream, StreamExt, TryStreamExt},
    truncate_long,
};
use async_stream::try_stream;
use std::{borrow::Cow, fmt, future::Future, pin::pin, sync::Arc};
use tokio::sync::Mutex;

/// Slot holding the connection of an open transaction.
///
/// Statements of the block lock it in issue order, the coordinator empties it
/// once the block settled so that late continuations can't reach the connection.
type Binding<D> = Arc<Mutex<Option<PooledConnection<D>>>>;

/// Entry point to a database: a pool plus the transaction coordinator.
///
/// Statements issued through [`Database::run`], [`Database::fetch`] and
/// [`Database::execute`] are routed to the transaction the calling
/// continuation belongs to, or to a connection leased for that single
/// statement when there is none.
pub struct Database<D: Driver> {
    pool: Pool<D>,
}

impl<D: Driver> Clone for Database<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<D: Driver> fmt::Debug for Database<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("pool", &self.pool).finish()
    }
}

impl<D: Driver> Database<D> {
    /// No connection is opened until the first statement needs one.
    pub fn new(driver: D, url: impl Into<Cow<'static, str>>, config: PoolConfig) -> Self {
        Self::with_pool(Pool::new(driver, url, config))
    }

    pub fn with_pool(pool: Pool<D>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    /// Lease a connection to use explicitly, outside of any transaction.
    pub async fn acquire(&self) -> Result<PooledConnection<D>> {
        self.pool.acquire().await
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// The open transaction of this database the calling continuation belongs to.
    ///
    /// Fails with [`TransactionError::ContextPropagationFailure`] when the
    /// continuation carries a key whose transaction has already ended.
    pub fn current_context(&self) -> Result<Option<Arc<LogicalContext>>> {
        let mut key = ambient::current();
        while let Some(current) = key {
            let Some(context) = registry().lookup(current) else {
                return Err(escaped(current));
            };
            if context.pool() == self.pool.id() {
                return Ok(Some(context));
            }
            key = context.parent();
        }
        Ok(None)
    }

    fn binding(&self) -> Result<Option<(ContextKey, Binding<D>)>> {
        let Some(context) = self.current_context()? else {
            return Ok(None);
        };
        match context.binding::<Binding<D>>() {
            Some(binding) => Ok(Some((context.key(), binding.clone()))),
            None => Err(escaped(context.key())),
        }
    }

    /// Send a statement, returning rows and affected counts as they come.
    pub fn run<'s>(
        &'s self,
        query: impl Into<String>,
    ) -> impl Stream<Item = Result<QueryResult>> + Send + 's {
        let query = query.into();
        try_stream! {
            match self.binding()? {
                Some((key, binding)) => {
                    // The slot is released before the first item is handed out,
                    // statements issued while consuming the results must not wait on it
                    let results = {
                        let mut slot = binding.lock().await;
                        let connection = slot.as_mut().ok_or_else(|| escaped(key))?;
                        log::trace!("Transaction {} runs:\n{}", key, truncate_long!(query));
                        connection.run(query).collect::<Vec<_>>().await
                    };
                    for result in results {
                        yield result?;
                    }
                }
                None => {
                    let mut connection = self.pool.acquire().await?;
                    {
                        let mut stream = pin!(connection.run(query));
                        while let Some(result) = stream.next().await {
                            yield result?;
                        }
                    }
                    connection.release();
                }
            }
        }
    }

    /// Send a statement and return the rows.
    pub fn fetch<'s>(
        &'s self,
        query: impl Into<String>,
    ) -> impl Stream<Item = Result<RowLabeled>> + Send + 's {
        self.run(query).try_filter_map(|v| async move {
            Ok(match v {
                QueryResult::Row(row) => Some(row),
                QueryResult::Affected(..) => None,
            })
        })
    }

    /// Send a statement and return the total number of rows affected.
    pub async fn execute(&self, query: impl Into<String>) -> Result<RowsAffected> {
        self.run(query)
            .try_filter_map(|v| async move {
                Ok(match v {
                    QueryResult::Affected(affected) => Some(affected),
                    QueryResult::Row(..) => None,
                })
            })
            .try_collect()
            .await
    }

    /// Run `block` inside a transaction.
    ///
    /// Every statement issued through this database by code causally descended
    /// from `block` runs on the same connection, inside the same transaction.
    /// The transaction commits when the block returns `Ok` and rolls back when
    /// it returns `Err`, in which case the error is returned unchanged.
    ///
    /// A call made while a transaction of this database is already open joins
    /// it: no new begin or commit is issued, and a failure of the inner block
    /// makes the outer transaction roll back.
    pub async fn transaction<F, Fut, T>(&self, block: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(context) = self.current_context()? {
            return join(context, block).await;
        }
        let parent = ambient::current();
        let mut connection = self.pool.acquire().await?;
        let mut sql = String::new();
        self.pool
            .driver()
            .sql_writer()
            .write_transaction_begin(&mut sql);
        if let Err(e) = connection.execute(sql).await {
            let error = e.context(format!(
                "Could not begin a transaction on connection {}",
                connection.id()
            ));
            log::error!("{:#}", error);
            return Err(error);
        }
        connection.set_in_transaction(true);

        let connection_id = connection.id();
        let binding: Binding<D> = Arc::new(Mutex::new(Some(connection)));
        let context = Arc::new(LogicalContext::new(
            ContextKey::next(),
            self.pool.id(),
            parent,
            connection_id,
            binding.clone(),
        ));
        let key = context.key();
        let registration = Registration::new(registry(), context.clone())?;
        log::debug!(
            "Transaction {} began on connection {}",
            key,
            connection_id
        );

        let timeout = self.pool.config().transaction_timeout;
        let outcome = ambient::scope(Some(key), async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, block())
                    .await
                    .unwrap_or_else(|_| Err(TransactionError::Timeout { timeout }.into())),
                None => block().await,
            }
        })
        .await;

        let slot = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, binding.lock()).await {
                Ok(mut slot) => slot.take(),
                Err(..) => {
                    // A continuation is still running a statement, the connection
                    // stays with it and is discarded once it lets go
                    let error = match outcome {
                        Err(error) => error,
                        Ok(..) => TransactionError::Timeout { timeout }.into(),
                    };
                    log::error!(
                        "Transaction {} could not reclaim connection {} within {:?}: {:#}",
                        key,
                        connection_id,
                        timeout,
                        error
                    );
                    drop(registration);
                    context.set_state(ContextState::Closed);
                    return Err(error);
                }
            },
            None => binding.lock().await.take(),
        };
        let Some(mut connection) = slot else {
            return Err(escaped(key));
        };
        let result = match outcome {
            Ok(value) if !context.is_rollback_only() => {
                self.commit(&context, &mut connection).await.map(|_| value)
            }
            Ok(..) => Err(TransactionError::RollbackOnly.into()),
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            self.rollback(&context, &mut connection, error).await;
        }
        drop(registration);
        context.set_state(ContextState::Closed);
        connection.release();
        result
    }

    async fn commit(
        &self,
        context: &LogicalContext,
        connection: &mut PooledConnection<D>,
    ) -> Result<()> {
        context.set_state(ContextState::Committing);
        let mut sql = String::new();
        self.pool
            .driver()
            .sql_writer()
            .write_transaction_commit(&mut sql);
        match connection.execute(sql).await {
            Ok(..) => {
                connection.set_in_transaction(false);
                log::debug!("Transaction {} committed", context.key());
                Ok(())
            }
            Err(e) => {
                let error = e.context(format!("Could not commit transaction {}", context.key()));
                log::error!("{:#}", error);
                Err(error)
            }
        }
    }

    /// Best effort, a failure is logged and the connection is not reused.
    async fn rollback(
        &self,
        context: &LogicalContext,
        connection: &mut PooledConnection<D>,
        cause: &Error,
    ) {
        context.set_state(ContextState::RolledBack);
        let mut sql = String::new();
        self.pool
            .driver()
            .sql_writer()
            .write_transaction_rollback(&mut sql);
        match connection.execute(sql).await {
            Ok(..) => {
                connection.set_in_transaction(false);
                log::debug!(
                    "Transaction {} rolled back because of: {:#}",
                    context.key(),
                    cause
                );
            }
            Err(e) => {
                log::error!(
                    "Could not roll back transaction {}, its outcome is indeterminate: {:#}\nThe transaction failed because of: {:#}",
                    context.key(),
                    e,
                    cause
                );
            }
        }
    }
}

async fn join<F, Fut, T>(context: Arc<LogicalContext>, block: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if context.state() != ContextState::Active {
        return Err(escaped(context.key()));
    }
    let nested = context.enter();
    log::trace!(
        "Nested block joined transaction {} at depth {}",
        context.key(),
        context.depth()
    );
    let result = block().await;
    drop(nested);
    if let Err(error) = &result {
        context.mark_rollback_only();
        log::debug!(
            "Nested block of transaction {} failed, the transaction will roll back: {:#}",
            context.key(),
            error
        );
    }
    result
}

fn escaped(key: ContextKey) -> Error {
    let error = Error::new(TransactionError::ContextPropagationFailure { key });
    log::error!("{:#}", error);
    error
}
