use crate::{Executor, Result};
use std::{borrow::Cow, future::Future};

/// A physical database session.
pub trait Connection: Executor + Sized + 'static {
    /// Open a connection to the given URL.
    fn connect(url: Cow<'static, str>) -> impl Future<Output = Result<Self>> + Send;

    /// Whether the transport reported this session unusable.
    ///
    /// A broken connection is discarded by the pool instead of being reused.
    fn is_broken(&self) -> bool {
        false
    }
}
