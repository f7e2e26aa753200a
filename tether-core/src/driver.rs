use crate::{Connection, Result, SqlWriter};
use std::{borrow::Cow, future::Future};

pub trait Driver: Send + Sync + 'static {
    type Connection: Connection<Driver = Self>;
    type SqlWriter: SqlWriter;

    const NAME: &'static str;

    fn sql_writer(&self) -> Self::SqlWriter;

    /// Open a new physical connection to `url`.
    fn connect(
        &self,
        url: Cow<'static, str>,
    ) -> impl Future<Output = Result<Self::Connection>> + Send {
        <Self::Connection as Connection>::connect(url)
    }
}
