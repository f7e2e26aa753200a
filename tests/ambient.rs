#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tether::{Context, ContextKey, PoolConfig, TransactionError, ambient};
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn key_follows_the_continuations() {
        let key = ContextKey::next();
        let seen = ambient::scope(Some(key), async {
            let nested = ambient::spawn(async {
                sleep(Duration::from_millis(1)).await;
                ambient::spawn(async { ambient::current() }).await
            });
            nested.await
        })
        .await
        .expect("The task panicked")
        .expect("The nested task panicked");
        assert_eq!(seen, Some(key));
        assert_eq!(ambient::current(), None);
    }

    #[test]
    fn pool_config_builder() {
        let config = PoolConfig::new(3)
            .acquire_timeout(None)
            .transaction_timeout(Duration::from_secs(5));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.acquire_timeout, None);
        assert_eq!(config.transaction_timeout, Some(Duration::from_secs(5)));
        let config = config.max_connections(8);
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn errors_are_classified_through_anyhow() {
        let error = tether::Error::new(TransactionError::PoolExhausted {
            timeout: Duration::from_millis(250),
        });
        let error = Err::<(), _>(error)
            .context("Could not run the block")
            .expect_err("It is an error");
        assert!(matches!(
            TransactionError::of(&error),
            Some(TransactionError::PoolExhausted { .. })
        ));
        assert_eq!(
            format!("{:#}", error),
            "Could not run the block: No connection available within 250ms, the pool is exhausted"
        );
    }
}
