mod resource {
    pub mod memory;
}

#[cfg(test)]
mod tests {
    use crate::resource::memory::MemoryDriver;
    use std::{sync::Arc, time::Duration};
    use tether_core::{
        Executor, Pool, PoolConfig, PoolStatus, TransactionError, stream::TryStreamExt,
    };
    use tokio::{sync::Mutex, time::sleep};

    fn pool(config: PoolConfig) -> (Pool<MemoryDriver>, MemoryDriver) {
        let driver = MemoryDriver::new();
        (Pool::new(driver.clone(), "memory://", config), driver)
    }

    #[tokio::test]
    async fn opens_lazily_and_reuses() {
        let (pool, driver) = pool(PoolConfig::new(2));
        assert_eq!(driver.journal.opened(), 0);
        assert_eq!(pool.status().open, 0);

        let connection = pool.acquire().await.expect("Could not acquire");
        let first = connection.id();
        assert_eq!(driver.journal.opened(), 1);
        assert_eq!(
            pool.status(),
            PoolStatus {
                capacity: 2,
                open: 1,
                idle: 0,
                leased: 1,
                waiting: 0,
            }
        );
        pool.release(connection);
        assert_eq!(pool.status().idle, 1);

        let connection = pool.acquire().await.expect("Could not acquire");
        assert_eq!(connection.id(), first);
        assert_eq!(driver.journal.opened(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let (pool, driver) = pool(PoolConfig::new(3));
        let mut leased = Vec::new();
        for _ in 0..3 {
            leased.push(pool.acquire().await.expect("Could not acquire"));
        }
        let mut ids = leased.iter().map(|c| c.id()).collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.status().leased, 3);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.status().waiting, 1);

        let released = leased.pop().expect("Three leases");
        let released_id = released.id();
        pool.release(released);
        let got = waiter
            .await
            .expect("Task panicked")
            .expect("Could not acquire");
        assert_eq!(got, released_id);
        assert_eq!(driver.journal.opened(), 3);
        assert_eq!(pool.status().open, 3);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let (pool, _) = pool(PoolConfig::new(1));
        let held = pool.acquire().await.expect("Could not acquire");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let connection = pool.acquire().await.expect("Could not acquire");
                order.lock().await.push(i);
                sleep(Duration::from_millis(2)).await;
                pool.release(connection);
            }));
            // Let the waiter enqueue before the next one
            sleep(Duration::from_millis(5)).await;
        }
        pool.release(held);
        for waiter in waiters {
            waiter.await.expect("Task panicked");
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn exhausted_after_timeout() {
        let (pool, _) = pool(PoolConfig::new(1).acquire_timeout(Duration::from_millis(30)));
        let _held = pool.acquire().await.expect("Could not acquire");
        let error = pool
            .acquire()
            .await
            .expect_err("The pool has no capacity left");
        assert!(matches!(
            TransactionError::of(&error),
            Some(TransactionError::PoolExhausted { timeout }) if *timeout == Duration::from_millis(30)
        ));
        assert_eq!(pool.status().waiting, 0);
    }

    #[tokio::test]
    async fn broken_connection_is_replaced() {
        let (pool, driver) = pool(PoolConfig::new(1));
        let mut connection = pool.acquire().await.expect("Could not acquire");
        let broken_id = connection.id();
        let error = connection
            .execute("BREAK".into())
            .await
            .expect_err("BREAK must fail");
        assert!(matches!(
            TransactionError::of(&error),
            Some(TransactionError::ConnectionBroken { .. })
        ));
        assert!(connection.is_broken());
        pool.release(connection);
        assert_eq!(pool.status().open, 0);
        assert_eq!(pool.status().idle, 0);

        let mut connection = pool.acquire().await.expect("Could not acquire");
        assert_ne!(connection.id(), broken_id);
        assert_eq!(driver.journal.opened(), 2);
        let rows = connection
            .fetch("SELECT CONNECTION".into())
            .try_collect::<Vec<_>>()
            .await
            .expect("Could not fetch");
        assert_eq!(rows[0].values()[0].as_i64(), Some(2));
    }

    #[tokio::test]
    async fn dropped_lease_goes_back() {
        let (pool, driver) = pool(PoolConfig::new(1));
        drop(pool.acquire().await.expect("Could not acquire"));
        assert_eq!(pool.status().idle, 1);
        drop(pool.acquire().await.expect("Could not acquire"));
        assert_eq!(driver.journal.opened(), 1);
    }

    #[tokio::test]
    async fn failed_open_gives_capacity_back() {
        let driver = MemoryDriver::new();
        let pool = Pool::new(
            driver,
            "postgres://nowhere",
            PoolConfig::new(1).acquire_timeout(Duration::from_millis(50)),
        );
        for _ in 0..2 {
            let error = pool.acquire().await.expect_err("The url is not a memory url");
            assert!(TransactionError::of(&error).is_none());
        }
        assert_eq!(pool.status().open, 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let (pool, _) = pool(PoolConfig::new(2));
        let connection = pool.acquire().await.expect("Could not acquire");
        pool.release(connection);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.status().open, 0);
        let error = pool.acquire().await.expect_err("The pool is closed");
        assert!(matches!(
            TransactionError::of(&error),
            Some(TransactionError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn zero_capacity_means_one() {
        let (pool, _) = pool(PoolConfig::new(0));
        assert_eq!(pool.config().max_connections, 1);
        pool.acquire().await.expect("Could not acquire");
    }
}
