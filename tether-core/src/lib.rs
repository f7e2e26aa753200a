pub mod ambient;
mod connection;
mod context;
mod database;
mod driver;
mod error;
mod executor;
mod pool;
mod query;
mod registry;
mod sql_writer;
mod util;
mod value;

pub use ::anyhow::Context;
pub use connection::*;
pub use context::*;
pub use database::*;
pub use driver::*;
pub use error::*;
pub use executor::*;
pub use pool::*;
pub use query::*;
pub use registry::*;
pub use sql_writer::*;
pub use value::*;
pub mod stream {
    pub use ::futures::stream::*;
}
pub use ::futures::future;

pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;
