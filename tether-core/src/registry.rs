use crate::{ContextKey, Error, LogicalContext, Result, TransactionError};
use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError},
};

static REGISTRY: LazyLock<ContextRegistry> = LazyLock::new(ContextRegistry::new);

/// The process-wide registry consulted by every statement.
pub fn registry() -> &'static ContextRegistry {
    &REGISTRY
}

/// Maps the ambient key of a continuation to its open transaction.
///
/// Tokio runs tasks on several threads, so the map sits behind a mutex. The
/// lock is never held across an await point.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<ContextKey, Arc<LogicalContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextKey, Arc<LogicalContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind(&self, context: Arc<LogicalContext>) -> Result<()> {
        let key = context.key();
        let mut contexts = self.contexts();
        if contexts.contains_key(&key) {
            let error = Error::new(TransactionError::ContextAlreadyBound { key });
            log::error!("{:#}", error);
            return Err(error);
        }
        contexts.insert(key, context);
        Ok(())
    }

    pub fn lookup(&self, key: ContextKey) -> Option<Arc<LogicalContext>> {
        self.contexts().get(&key).cloned()
    }

    /// Remove the context bound to `key`, if any.
    pub fn unbind(&self, key: ContextKey) -> Option<Arc<LogicalContext>> {
        self.contexts().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts().is_empty()
    }
}

/// Keeps a context bound for as long as it lives.
pub(crate) struct Registration<'r> {
    registry: &'r ContextRegistry,
    key: ContextKey,
}

impl<'r> Registration<'r> {
    pub(crate) fn new(registry: &'r ContextRegistry, context: Arc<LogicalContext>) -> Result<Self> {
        let key = context.key();
        registry.bind(context)?;
        Ok(Self { registry, key })
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unbind(self.key);
        log::trace!("Context {} unbound", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolId;

    fn context(key: ContextKey) -> Arc<LogicalContext> {
        Arc::new(LogicalContext::new(key, PoolId::next(), None, 1, ()))
    }

    #[test]
    fn bind_lookup_unbind() {
        let registry = ContextRegistry::new();
        let key = ContextKey::next();
        assert!(registry.lookup(key).is_none());
        registry.bind(context(key)).expect("Could not bind the context");
        assert_eq!(registry.lookup(key).map(|v| v.key()), Some(key));
        assert_eq!(registry.len(), 1);
        assert!(registry.unbind(key).is_some());
        assert!(registry.unbind(key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn bind_twice_fails() {
        let registry = ContextRegistry::new();
        let key = ContextKey::next();
        registry.bind(context(key)).expect("Could not bind the context");
        let error = registry
            .bind(context(key))
            .expect_err("A live key must not be bound twice");
        assert!(matches!(
            TransactionError::of(&error),
            Some(TransactionError::ContextAlreadyBound { key: k }) if *k == key
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registration_unbinds_on_drop() {
        let registry = ContextRegistry::new();
        let key = ContextKey::next();
        {
            let _registration = Registration::new(&registry, context(key))
                .expect("Could not register the context");
            assert!(registry.lookup(key).is_some());
        }
        assert!(registry.lookup(key).is_none());
        assert!(registry.is_empty());
    }
}
