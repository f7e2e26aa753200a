use crate::PoolId;
use std::{
    any::Any,
    fmt::{self, Display},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

/// Opaque identifier of one logical execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(u64);

impl ContextKey {
    /// A key never handed out before in this process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Active,
    Committing,
    RolledBack,
    Closed,
}

/// The state of one in-flight transactional block.
///
/// The bound connection stays owned by the coordinator that leased it, the
/// context only carries a shared handle to the slot holding it.
pub struct LogicalContext {
    key: ContextKey,
    pool: PoolId,
    parent: Option<ContextKey>,
    connection: u64,
    state: Mutex<ContextState>,
    depth: AtomicUsize,
    rollback_only: AtomicBool,
    binding: Box<dyn Any + Send + Sync>,
}

impl LogicalContext {
    pub(crate) fn new<B: Any + Send + Sync>(
        key: ContextKey,
        pool: PoolId,
        parent: Option<ContextKey>,
        connection: u64,
        binding: B,
    ) -> Self {
        Self {
            key,
            pool,
            parent,
            connection,
            state: Mutex::new(ContextState::Active),
            depth: AtomicUsize::new(0),
            rollback_only: AtomicBool::new(false),
            binding: Box::new(binding),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Pool the bound connection was leased from.
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    /// Context that was current when this one began, on another pool.
    pub fn parent(&self) -> Option<ContextKey> {
        self.parent
    }

    /// Identity of the bound connection.
    pub fn connection_id(&self) -> u64 {
        self.connection
    }

    pub fn state(&self) -> ContextState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Number of nested blocks currently joined to this context.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Relaxed);
    }

    pub(crate) fn enter(&self) -> Nested<'_> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        Nested(self)
    }

    pub(crate) fn binding<B: Any>(&self) -> Option<&B> {
        self.binding.downcast_ref::<B>()
    }
}

impl fmt::Debug for LogicalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalContext")
            .field("key", &self.key)
            .field("pool", &self.pool)
            .field("parent", &self.parent)
            .field("connection", &self.connection)
            .field("state", &self.state())
            .field("depth", &self.depth())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

/// Depth guard of a nested block.
pub(crate) struct Nested<'a>(&'a LogicalContext);

impl Drop for Nested<'_> {
    fn drop(&mut self) {
        self.0.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
