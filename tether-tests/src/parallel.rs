use rand::Rng;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
    time::Duration,
};
use tether::{Database, Driver, Error, TransactionError, stream::TryStreamExt};
use tokio::{sync::Mutex, time::sleep};

static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

const BLOCKS: i64 = 100;
const FIRST_ID: i64 = 1_000_001;

#[derive(Debug)]
struct Refused(i64);

impl std::fmt::Display for Refused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block {} refused to commit", self.0)
    }
}

impl std::error::Error for Refused {}

/// Concurrent blocks inserting a person, then after a timer its pet, about
/// half of them failing right after the second insert.
pub async fn parallel<D: Driver>(database: &Database<D>) {
    let _lock = MUTEX.lock().await;
    let db = database;

    // Setup
    db.execute(
        "DROP TABLE IF EXISTS pet;
        DROP TABLE IF EXISTS person;
        CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
        CREATE TABLE pet (id INTEGER PRIMARY KEY, owner INTEGER NOT NULL, name TEXT NOT NULL);",
    )
    .await
    .expect("Failed to create the person and pet tables");

    let plan = {
        let mut rng = rand::thread_rng();
        (0..BLOCKS)
            .map(|i| (FIRST_ID + i, rng.gen_range(1..=5u64), rng.gen_bool(0.5)))
            .collect::<Vec<_>>()
    };
    let tasks = plan
        .iter()
        .map(|&(id, delay, fail)| {
            let database = database.clone();
            tokio::spawn(async move {
                let db = &database;
                db.transaction(|| async move {
                    db.execute(format!(
                        "INSERT INTO person (id, name) VALUES ({}, 'person {}');",
                        id, id
                    ))
                    .await?;
                    let parent = db.current_context()?.map(|v| v.connection_id());
                    sleep(Duration::from_millis(delay)).await;
                    db.execute(format!(
                        "INSERT INTO pet (id, owner, name) VALUES ({}, {}, 'pet of {}');",
                        id, id, id
                    ))
                    .await?;
                    let child = db.current_context()?.map(|v| v.connection_id());
                    if parent.is_none() || parent != child {
                        return Err(Error::msg(format!(
                            "Block {} moved from connection {:?} to {:?}",
                            id, parent, child
                        )));
                    }
                    if fail {
                        return Err(Refused(id).into());
                    }
                    Ok(())
                })
                .await
            })
        })
        .collect::<Vec<_>>();

    let mut committed = BTreeSet::new();
    for (task, &(id, _, fail)) in tasks.into_iter().zip(plan.iter()) {
        let outcome = task.await.expect("A block panicked");
        match outcome {
            Ok(()) => {
                assert!(!fail, "Block {} should have failed", id);
                committed.insert(id);
            }
            Err(e) => {
                assert!(
                    matches!(e.downcast_ref::<Refused>(), Some(Refused(v)) if *v == id),
                    "Block {} failed unexpectedly: {:#}",
                    id,
                    e
                );
                assert!(fail, "Block {} should have committed", id);
                assert!(TransactionError::of(&e).is_none());
            }
        }
    }

    let persons = db
        .fetch("SELECT id, name FROM person;")
        .map_ok(|row| {
            (
                row.values()[0].as_i64().unwrap_or_default(),
                row.values()[1].as_str().unwrap_or_default().to_string(),
            )
        })
        .try_collect::<BTreeMap<_, _>>()
        .await
        .expect("Could not read the persons");
    let pets = db
        .fetch("SELECT id, owner, name FROM pet;")
        .map_ok(|row| {
            (
                row.values()[0].as_i64().unwrap_or_default(),
                (
                    row.values()[1].as_i64().unwrap_or_default(),
                    row.values()[2].as_str().unwrap_or_default().to_string(),
                ),
            )
        })
        .try_collect::<BTreeMap<_, _>>()
        .await
        .expect("Could not read the pets");

    // All or nothing per block
    assert_eq!(persons.keys().copied().collect::<BTreeSet<_>>(), committed);
    assert_eq!(pets.keys().copied().collect::<BTreeSet<_>>(), committed);
    // Never paired with the row of another block
    for (id, name) in &persons {
        assert_eq!(*name, format!("person {}", id));
        let (owner, pet) = &pets[id];
        assert_eq!(owner, id);
        assert_eq!(*pet, format!("pet of {}", id));
    }
    assert_eq!(db.pool().status().leased, 0);
    log::debug!(
        "{} of {} concurrent blocks committed",
        committed.len(),
        BLOCKS
    );
}
