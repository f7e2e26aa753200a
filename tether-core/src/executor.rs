use crate::{
    Driver, QueryResult, Result, RowLabeled, RowsAffected,
    stream::{Stream, StreamExt, TryStreamExt},
};
use std::future::Future;

/// Something statements can be sent to.
pub trait Executor: Send {
    type Driver: Driver;

    /// General method to send any query and return any result type (either row or count)
    fn run<'s>(&'s mut self, query: String) -> impl Stream<Item = Result<QueryResult>> + Send + 's;

    /// Execute the query and returns the rows.
    fn fetch<'s>(&'s mut self, query: String) -> impl Stream<Item = Result<RowLabeled>> + Send + 's {
        self.run(query).filter_map(|v| async move {
            match v {
                Ok(QueryResult::Row(v)) => Some(Ok(v)),
                Err(e) => Some(Err(e)),
                _ => None,
            }
        })
    }

    /// Execute the query and return the total number of rows affected.
    fn execute(&mut self, query: String) -> impl Future<Output = Result<RowsAffected>> + Send {
        self.run(query)
            .filter_map(|v| async move {
                match v {
                    Ok(QueryResult::Affected(v)) => Some(Ok(v)),
                    Err(e) => Some(Err(e)),
                    _ => None,
                }
            })
            .try_collect()
    }
}
