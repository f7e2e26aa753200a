#![allow(dead_code)]

use async_stream::try_stream;
use log::LevelFilter;
use std::{
    borrow::Cow,
    env,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tether_core::{
    Connection, Driver, Error, Executor, QueryResult, Result, RowLabeled, RowsAffected, SqlWriter,
    TransactionError, Value, stream::Stream,
};

pub fn init_logs() {
    let mut logger = env_logger::builder();
    logger
        .is_test(true)
        .format_file(true)
        .format_line_number(true);
    if env::var("RUST_LOG").is_err() {
        logger.filter_level(LevelFilter::Warn);
    }
    let _ = logger.try_init();
}

/// Statements seen by every connection of a [`MemoryDriver`], in order.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<(u64, String)>>,
    opened: AtomicU64,
    fail_rollback: AtomicBool,
    fail_commit: AtomicBool,
}

impl Journal {
    pub fn entries(&self) -> Vec<(u64, String)> {
        self.entries.lock().unwrap().clone()
    }

    /// Statements issued on connection `serial`.
    pub fn of(&self, serial: u64) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| *s == serial)
            .map(|(_, q)| q)
            .collect()
    }

    pub fn count(&self, query: &str) -> usize {
        self.entries().iter().filter(|(_, q)| q == query).count()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn fail_rollback(&self, value: bool) {
        self.fail_rollback.store(value, Ordering::Relaxed);
    }

    pub fn fail_commit(&self, value: bool) {
        self.fail_commit.store(value, Ordering::Relaxed);
    }
}

/// Driver that records statements instead of talking to a database.
///
/// `SELECT CONNECTION` returns the serial of the connection, `FAIL` errors,
/// `BREAK` errors and marks the connection broken, `SLEEP <ms>` waits, every
/// other statement affects one row.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    pub journal: Arc<Journal>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
pub struct MemorySqlWriter;

impl SqlWriter for MemorySqlWriter {}

impl Driver for MemoryDriver {
    type Connection = MemoryConnection;
    type SqlWriter = MemorySqlWriter;

    const NAME: &'static str = "memory";

    fn sql_writer(&self) -> MemorySqlWriter {
        MemorySqlWriter
    }

    async fn connect(&self, url: Cow<'static, str>) -> Result<MemoryConnection> {
        if !url.starts_with("memory://") {
            return Err(Error::msg(format!(
                "Expected memory connection url, got `{}`",
                url
            )));
        }
        let serial = self.journal.opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MemoryConnection {
            serial,
            journal: self.journal.clone(),
            broken: false,
        })
    }
}

pub struct MemoryConnection {
    serial: u64,
    journal: Arc<Journal>,
    broken: bool,
}

impl MemoryConnection {
    async fn respond(&mut self, query: &str) -> Result<Option<QueryResult>> {
        self.journal
            .entries
            .lock()
            .unwrap()
            .push((self.serial, query.to_string()));
        if self.broken {
            return Err(TransactionError::ConnectionBroken {
                connection: self.serial,
                reason: "already broken".into(),
            }
            .into());
        }
        let journal = &self.journal;
        Ok(Some(match query {
            "SELECT CONNECTION" => QueryResult::Row(RowLabeled::new(
                ["connection".to_string()].into(),
                [Value::Int64(self.serial as i64)].into(),
            )),
            "FAIL" => return Err(Error::msg("Statement failed")),
            "BREAK" => {
                self.broken = true;
                return Err(TransactionError::ConnectionBroken {
                    connection: self.serial,
                    reason: "transport closed".into(),
                }
                .into());
            }
            "ROLLBACK;" if journal.fail_rollback.load(Ordering::Relaxed) => {
                return Err(Error::msg("Rollback failed"));
            }
            "COMMIT;" if journal.fail_commit.load(Ordering::Relaxed) => {
                return Err(Error::msg("Commit failed"));
            }
            sleep if sleep.starts_with("SLEEP ") => {
                let ms = sleep["SLEEP ".len()..].parse::<u64>()?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                return Ok(None);
            }
            _ => QueryResult::Affected(RowsAffected {
                rows_affected: 1,
                last_affected_id: None,
            }),
        }))
    }
}

impl Executor for MemoryConnection {
    type Driver = MemoryDriver;

    fn run<'s>(
        &'s mut self,
        query: String,
    ) -> impl Stream<Item = Result<QueryResult>> + Send + 's {
        try_stream! {
            if let Some(result) = self.respond(&query).await? {
                yield result;
            }
        }
    }
}

impl Connection for MemoryConnection {
    async fn connect(_url: Cow<'static, str>) -> Result<Self> {
        Err(Error::msg("A memory connection is opened through its MemoryDriver"))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
