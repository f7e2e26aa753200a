mod commit;
mod deferred;
mod isolation;
mod nested;
mod parallel;
mod rollback;

use crate::{
    commit::commit, deferred::deferred, isolation::isolation, nested::nested, parallel::parallel,
    rollback::rollback,
};
use log::LevelFilter;
use std::env;
use tether::{Database, Driver, Value, stream::TryStreamExt};

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

/// Runs the whole suite against `database`.
///
/// The pool needs at least two connections: some checks read from outside a
/// transaction while it is still open.
pub async fn execute_tests<D: Driver>(database: Database<D>) {
    assert!(
        database.pool().config().max_connections >= 2,
        "The test suite needs a pool of at least two connections"
    );
    commit(&database).await;
    rollback(&database).await;
    nested(&database).await;
    deferred(&database).await;
    isolation(&database).await;
    parallel(&database).await;
}

#[macro_export]
macro_rules! silent_logs {
    ($($code:tt)+) => {{
        let level = log::max_level();
        log::set_max_level(log::LevelFilter::Off);
        $($code)+
        log::set_max_level(level);
    }};
}

/// First column of every row returned by `query`.
pub(crate) async fn column<D: Driver>(database: &Database<D>, query: &str) -> Vec<Value> {
    database
        .fetch(query)
        .map_ok(|row| row.values()[0].clone())
        .try_collect()
        .await
        .expect(format!("Could not fetch:\n{}", query).as_str())
}

/// Single integer returned by `query`.
pub(crate) async fn count<D: Driver>(database: &Database<D>, query: &str) -> i64 {
    column(database, query)
        .await
        .first()
        .and_then(Value::as_i64)
        .expect(format!("Expected a number from:\n{}", query).as_str())
}
