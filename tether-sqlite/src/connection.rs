use crate::{
    CBox, SqliteDriver, error_message_from_ptr,
    extract::{extract_name, extract_value},
};
use async_stream::try_stream;
use libsqlite3_sys::{
    SQLITE_CANTOPEN, SQLITE_CORRUPT, SQLITE_DONE, SQLITE_IOERR, SQLITE_MISUSE, SQLITE_NOTADB,
    SQLITE_OK, SQLITE_OPEN_CREATE, SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_READWRITE, SQLITE_OPEN_URI,
    SQLITE_ROW, sqlite3, sqlite3_busy_timeout, sqlite3_close, sqlite3_column_count,
    sqlite3_errmsg, sqlite3_finalize, sqlite3_last_insert_rowid, sqlite3_open_v2,
    sqlite3_prepare_v2, sqlite3_step, sqlite3_stmt, sqlite3_total_changes64,
};
use std::{
    borrow::Cow,
    ffi::{CString, c_char, c_int},
    ptr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tether_core::{
    Connection, Context, Driver, Error, Executor, QueryResult, Result, RowLabeled, RowNames,
    RowsAffected, TransactionError, stream::Stream, truncate_long,
};
use tokio::task::spawn_blocking;

/// How long a statement waits for a lock held by another connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteConnection {
    pub(crate) connection: Arc<CBox<*mut sqlite3>>,
    serial: u64,
    broken: Arc<AtomicBool>,
}

impl SqliteConnection {
    fn failure(&self, connection: *mut sqlite3, rc: c_int, query: &str) -> Error {
        let message = unsafe { error_message_from_ptr(&sqlite3_errmsg(connection)).to_string() };
        let error = if is_fatal(rc) {
            self.broken.store(true, Ordering::Relaxed);
            Error::new(TransactionError::ConnectionBroken {
                connection: self.serial,
                reason: message,
            })
        } else {
            Error::msg(message)
        };
        error.context(format!("While executing the query:\n{}", truncate_long!(query)))
    }

    fn handle(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            serial: self.serial,
            broken: self.broken.clone(),
        }
    }
}

/// Primary result codes after which the session can't be trusted anymore.
fn is_fatal(rc: c_int) -> bool {
    matches!(
        rc & 0xff,
        SQLITE_IOERR | SQLITE_CORRUPT | SQLITE_NOTADB | SQLITE_CANTOPEN | SQLITE_MISUSE
    )
}

/// Runs every statement of `query`, one after the other.
fn execute_all(connection: &SqliteConnection, query: &str) -> Result<Vec<QueryResult>> {
    let sql = CString::new(query).context("Could not create a CString from the query String")?;
    let db = **connection.connection;
    let mut results = Vec::new();
    unsafe {
        let mut tail: *const c_char = sql.as_ptr();
        while *tail != 0 {
            let mut statement = CBox::new(ptr::null_mut::<sqlite3_stmt>(), |p| {
                sqlite3_finalize(p);
            });
            let mut next = ptr::null();
            let rc = sqlite3_prepare_v2(db, tail, -1, &mut *statement, &mut next);
            if rc != SQLITE_OK {
                return Err(connection.failure(db, rc, query));
            }
            tail = next;
            if statement.is_null() {
                // Whitespace or comment
                continue;
            }
            let changes = sqlite3_total_changes64(db);
            let count = sqlite3_column_count(*statement);
            let names = (0..count)
                .map(|i| extract_name(*statement, i))
                .collect::<Result<RowNames>>()?;
            loop {
                match sqlite3_step(*statement) {
                    SQLITE_ROW => {
                        let values = (0..count)
                            .map(|i| extract_value(*statement, i))
                            .collect::<Result<_>>()?;
                        results.push(QueryResult::Row(RowLabeled::new(names.clone(), values)));
                    }
                    SQLITE_DONE => break,
                    rc => return Err(connection.failure(db, rc, query)),
                }
            }
            if count == 0 {
                results.push(QueryResult::Affected(RowsAffected {
                    rows_affected: (sqlite3_total_changes64(db) - changes).max(0) as u64,
                    last_affected_id: Some(sqlite3_last_insert_rowid(db)),
                }));
            }
        }
    }
    Ok(results)
}

impl Executor for SqliteConnection {
    type Driver = SqliteDriver;

    fn run<'s>(
        &'s mut self,
        query: String,
    ) -> impl Stream<Item = Result<QueryResult>> + Send + 's {
        let connection = self.handle();
        try_stream! {
            if connection.is_broken() {
                Err::<(), _>(TransactionError::ConnectionBroken {
                    connection: connection.serial,
                    reason: "a previous statement left the connection unusable".into(),
                })?;
            }
            let results = spawn_blocking(move || {
                let results = execute_all(&connection, &query);
                if let Err(e) = &results {
                    log::error!("{:#}", e);
                }
                results
            })
            .await??;
            for result in results {
                yield result;
            }
        }
    }
}

impl Connection for SqliteConnection {
    async fn connect(url: Cow<'static, str>) -> Result<SqliteConnection> {
        let prefix = format!("{}://", <Self::Driver as Driver>::NAME);
        if !url.starts_with(&prefix) {
            let error = Error::msg(format!(
                "Expected sqlite connection url to start with `{}`",
                &prefix
            ));
            log::error!("{:#}", error);
            return Err(error);
        }
        let context = || format!("Error while decoding connection URL: `{}`", url);
        let path = CString::new(format!("file:{}", url.trim_start_matches(&prefix)))
            .with_context(context)?;
        let mut connection = CBox::new(ptr::null_mut(), |p| unsafe {
            sqlite3_close(p);
        });
        unsafe {
            let rc = sqlite3_open_v2(
                path.as_ptr(),
                &mut *connection,
                SQLITE_OPEN_READWRITE | SQLITE_OPEN_CREATE | SQLITE_OPEN_URI | SQLITE_OPEN_FULLMUTEX,
                ptr::null(),
            );
            if rc != SQLITE_OK {
                let error = Error::msg(error_message_from_ptr(&sqlite3_errmsg(*connection)).to_string())
                    .context(format!("Could not open the sqlite database `{}`", url));
                log::error!("{:#}", error);
                return Err(error);
            }
            sqlite3_busy_timeout(*connection, BUSY_TIMEOUT.as_millis() as c_int);
        }
        Ok(Self {
            connection: Arc::new(connection),
            serial: next_serial(),
            broken: Default::default(),
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

fn next_serial() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
