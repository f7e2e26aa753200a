use crate::{column, count};
use std::sync::LazyLock;
use tether::{Database, Driver, Error, TransactionError, Value};
use tokio::sync::Mutex;

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn nested<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS nested_entity;
        CREATE TABLE nested_entity (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the nested_entity table");

    // Inner block joins the outer transaction
    db.transaction(|| async move {
        let outer = db.current_context()?.map(|v| v.connection_id());
        db.execute("INSERT INTO nested_entity (id, name) VALUES (1, 'outer');")
            .await?;
        db.transaction(|| async move {
            let context = db
                .current_context()?
                .expect("The nested block must run inside the transaction");
            assert_eq!(Some(context.connection_id()), outer);
            assert_eq!(context.depth(), 1);
            db.execute("INSERT INTO nested_entity (id, name) VALUES (2, 'inner');")
                .await?;
            Ok(())
        })
        .await?;
        Ok(())
    })
    .await
    .expect("Failed to commit the nested transaction");
    assert_eq!(
        column(db, "SELECT name FROM nested_entity ORDER BY id;").await,
        ["outer", "inner"].map(Value::from)
    );

    // Inner failure undoes the outer writes too
    let error = db
        .transaction(|| async move {
            db.execute("INSERT INTO nested_entity (id, name) VALUES (3, 'outer');")
                .await?;
            db.transaction(|| async move {
                db.execute("INSERT INTO nested_entity (id, name) VALUES (4, 'inner');")
                    .await?;
                Err::<(), _>(Error::msg("The inner block gave up"))
            })
            .await?;
            Ok(())
        })
        .await
        .expect_err("The inner failure must fail the transaction");
    assert_eq!(error.to_string(), "The inner block gave up");
    assert_eq!(count(db, "SELECT COUNT(*) FROM nested_entity;").await, 2);

    // Swallowing the inner failure does not save the transaction
    let error = db
        .transaction(|| async move {
            db.execute("INSERT INTO nested_entity (id, name) VALUES (5, 'outer');")
                .await?;
            let _ = db
                .transaction(|| async move { Err::<(), _>(Error::msg("Ignored")) })
                .await;
            Ok(())
        })
        .await
        .expect_err("The transaction was marked rollback only");
    assert!(matches!(
        TransactionError::of(&error),
        Some(TransactionError::RollbackOnly)
    ));
    assert_eq!(count(db, "SELECT COUNT(*) FROM nested_entity;").await, 2);
    assert_eq!(db.pool().status().leased, 0);
}
