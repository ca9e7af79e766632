use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tasktrack_core::models::{TaskErrorKind, TaskId, TaskStatus, TaskTransition};
use tasktrack_core::persistence::{MigrationStore, TaskStore};
use tasktrack_core::sqlite::{SqliteTaskStore, current_schema_version, migration, migrations};

fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("tasktrack-{test_name}-{nanos}.sqlite3"))
}

fn id(raw: &str) -> TaskId {
    TaskId::from(raw)
}

#[test]
fn migrations_are_ordered_and_reversible() {
    let mut previous = 0;
    for entry in migrations() {
        assert!(entry.version > previous);
        assert!(!entry.up_sql.trim().is_empty(), "{} has no up sql", entry.name);
        assert!(!entry.down_sql.trim().is_empty(), "{} has no down sql", entry.name);
        previous = entry.version;
    }
    assert_eq!(
        migration(current_schema_version()).map(|entry| entry.version),
        Some(current_schema_version())
    );
}

#[test]
fn open_migrates_and_can_roll_back() {
    let path = temp_db_path("migrations");
    let store = SqliteTaskStore::open(&path).unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());
    assert_eq!(store.planned_migrations(0).len(), migrations().len());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    let error = store.apply_migration(current_schema_version() + 1).unwrap_err();
    assert_eq!(error.kind, TaskErrorKind::StoreUnavailable);

    let _ = std::fs::remove_file(path);
}

#[test]
fn records_survive_reopening_the_database() {
    let path = temp_db_path("durability");
    {
        let store = SqliteTaskStore::open(&path).unwrap();
        store.create(&id("a"), "add").unwrap();
        store.transition(&id("a"), TaskTransition::Start).unwrap();
        store
            .transition(&id("a"), TaskTransition::Complete(json!({"sum": 8, "parts": [3, 5]})))
            .unwrap();
        store.create(&id("b"), "explode").unwrap();
        store
            .transition(&id("b"), TaskTransition::Fail("boom".to_string()))
            .unwrap();
    }

    let reopened = SqliteTaskStore::open(&path).unwrap();
    let a = reopened.get(&id("a")).unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.func_name, "add");
    assert_eq!(a.result, Some(json!({"sum": 8, "parts": [3, 5]})));
    assert!(a.started_at.is_some());
    assert!(a.completed_at.is_some());

    let b = reopened.get(&id("b")).unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("boom"));
    assert_eq!(b.result, None);

    let _ = std::fs::remove_file(path);
}

#[test]
fn duplicate_create_and_unknown_ids_are_reported() {
    let path = temp_db_path("duplicates");
    let store = SqliteTaskStore::open(&path).unwrap();
    store.create(&id("a"), "add").unwrap();

    assert_eq!(
        store.create(&id("a"), "add").unwrap_err().kind,
        TaskErrorKind::DuplicateTask
    );
    assert_eq!(store.get(&id("missing")).unwrap(), None);
    assert_eq!(
        store
            .transition(&id("missing"), TaskTransition::Cancel)
            .unwrap_err()
            .kind,
        TaskErrorKind::NotFound
    );
    assert!(store.delete(&id("a")).unwrap());
    assert!(!store.delete(&id("a")).unwrap());

    let _ = std::fs::remove_file(path);
}

#[test]
fn list_orders_by_creation_newest_first() {
    let path = temp_db_path("list");
    let store = SqliteTaskStore::open(&path).unwrap();
    for raw in ["one", "two", "three"] {
        store.create(&id(raw), "noop").unwrap();
    }

    let listed: Vec<_> = store
        .list(2)
        .unwrap()
        .into_iter()
        .map(|record| record.task_id)
        .collect();
    assert_eq!(listed, vec![id("three"), id("two")]);
    assert!(store.list(0).unwrap().is_empty());
    assert_eq!(store.list(usize::MAX).unwrap().len(), 3);

    let _ = std::fs::remove_file(path);
}

#[test]
fn terminal_records_reject_further_transitions() {
    let path = temp_db_path("terminal");
    let store = SqliteTaskStore::open(&path).unwrap();
    store.create(&id("a"), "noop").unwrap();
    let cancelled = store.transition(&id("a"), TaskTransition::Cancel).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let error = store
        .transition(&id("a"), TaskTransition::Complete(json!(1)))
        .unwrap_err();
    assert_eq!(error.kind, TaskErrorKind::InvalidTransition);
    assert_eq!(store.get(&id("a")).unwrap(), Some(cancelled));

    let _ = std::fs::remove_file(path);
}

#[test]
fn concurrent_writers_produce_a_single_terminal_state() {
    let path = temp_db_path("race");
    let store = Arc::new(SqliteTaskStore::open(&path).unwrap());
    store.create(&id("race"), "add").unwrap();

    let writers: Vec<_> = (0..4)
        .map(|index| {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .transition(&id("race"), TaskTransition::Complete(json!(index)))
                    .is_ok()
            })
        })
        .collect();
    let winners = writers
        .into_iter()
        .map(|writer| writer.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(
        store.get(&id("race")).unwrap().unwrap().status,
        TaskStatus::Completed
    );

    let _ = std::fs::remove_file(path);
}

#[test]
fn prune_expired_keeps_unfinished_tasks() {
    let path = temp_db_path("prune");
    let store = SqliteTaskStore::open(&path).unwrap();
    store.create(&id("done"), "noop").unwrap();
    store.create(&id("running"), "noop").unwrap();
    store.transition(&id("running"), TaskTransition::Start).unwrap();
    store
        .transition(&id("done"), TaskTransition::Complete(json!(true)))
        .unwrap();

    assert_eq!(store.prune_expired(Duration::from_secs(3600)).unwrap(), 0);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(store.prune_expired(Duration::from_millis(5)).unwrap(), 1);
    assert_eq!(store.get(&id("done")).unwrap(), None);
    assert!(store.get(&id("running")).unwrap().is_some());

    let _ = std::fs::remove_file(path);
}
