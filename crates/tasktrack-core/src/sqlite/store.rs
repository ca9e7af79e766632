use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::models::{
    TaskError, TaskErrorKind, TaskId, TaskRecord, TaskStatus, TaskTransition, TaskValue,
};
use crate::persistence::{MigrationStore, PersistenceResult, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "tasktrack_schema_migrations";

const TASK_COLUMNS: &str = "task_id, func_name, status, created_at_ms, started_at_ms, \
                            completed_at_ms, result_json, error_message";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable task store in a single SQLite file. A connection is opened per
/// operation; writers of the same task serialize through an immediate
/// transaction.
pub struct SqliteTaskStore {
    database_path: PathBuf,
}

impl SqliteTaskStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Creates the store and brings its schema to the latest version.
    pub fn open(database_path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let store = Self::new(database_path);
        store.migrate_to_latest()?;
        Ok(store)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path).storage(operation_name)?;
        operation(&mut connection)
    }
}

impl MigrationStore for SqliteTaskStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection).storage("current_version")?;
            read_current_version(connection).storage("current_version")
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection).storage("apply_migration")?;
            let current_version = read_current_version(connection).storage("apply_migration")?;

            if target_version == current_version {
                // All DDL is IF NOT EXISTS, so replaying repairs a schema whose
                // version row survived while its tables did not.
                for version in 1..=target_version {
                    connection
                        .execute_batch(defined_migration(version)?.up_sql)
                        .storage("apply_migration")?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)
                        .storage("apply_migration")?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)
                        .storage("apply_migration")?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, task_id: &TaskId, func_name: &str) -> PersistenceResult<TaskRecord> {
        self.with_connection("create", |connection| {
            ensure_schema_ready(connection).storage("create")?;
            let created_at = truncate_to_millis(SystemTime::now());
            let record = TaskRecord::pending(task_id.clone(), func_name, created_at);

            let inserted = connection
                .execute(
                    "
INSERT INTO task_records (task_id, func_name, status, created_at_ms)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(task_id) DO NOTHING
",
                    params![
                        task_id.as_str(),
                        func_name,
                        record.status.as_str(),
                        to_unix_millis(created_at).storage("create")?,
                    ],
                )
                .storage("create")?;

            if inserted == 0 {
                return Err(TaskError::for_task(
                    TaskErrorKind::DuplicateTask,
                    task_id,
                    format!("task id '{task_id}' already exists"),
                ));
            }
            Ok(record)
        })
    }

    fn get(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("get", |connection| {
            ensure_schema_ready(connection).storage("get")?;
            select_record(connection, task_id).storage("get")
        })
    }

    fn update(&self, record: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("update", |connection| {
            ensure_schema_ready(connection).storage("update")?;
            let updated = write_record(connection, record).storage("update")?;
            if updated == 0 {
                return Err(not_found(&record.task_id));
            }
            Ok(())
        })
    }

    fn delete(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        self.with_connection("delete", |connection| {
            ensure_schema_ready(connection).storage("delete")?;
            let deleted = connection
                .execute(
                    "DELETE FROM task_records WHERE task_id = ?1",
                    [task_id.as_str()],
                )
                .storage("delete")?;
            Ok(deleted > 0)
        })
    }

    fn list(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list", |connection| {
            ensure_schema_ready(connection).storage("list")?;
            let mut statement = connection
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM task_records
                     ORDER BY created_at_ms DESC, sequence DESC
                     LIMIT ?1"
                ))
                .storage("list")?;
            // LIMIT takes an i64; larger limits mean every record.
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = statement
                .query_map(params![limit], read_record)
                .storage("list")?;
            rows.collect::<rusqlite::Result<Vec<_>>>().storage("list")
        })
    }

    fn transition(
        &self,
        task_id: &TaskId,
        transition: TaskTransition,
    ) -> PersistenceResult<TaskRecord> {
        self.with_connection("transition", |connection| {
            ensure_schema_ready(connection).storage("transition")?;
            let transaction = connection
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("transition")?;

            let mut record = select_record(&transaction, task_id)
                .storage("transition")?
                .ok_or_else(|| not_found(task_id))?;
            record.apply(transition, truncate_to_millis(SystemTime::now()))?;

            write_record(&transaction, &record).storage("transition")?;
            transaction.commit().storage("transition")?;
            Ok(record)
        })
    }

    fn prune_expired(&self, max_age: Duration) -> PersistenceResult<usize> {
        self.with_connection("prune_expired", |connection| {
            ensure_schema_ready(connection).storage("prune_expired")?;
            let cutoff = SystemTime::now()
                .checked_sub(max_age)
                .unwrap_or(UNIX_EPOCH);
            let cutoff_ms = to_unix_millis(cutoff).storage("prune_expired")?;
            let deleted = connection
                .execute(
                    "
DELETE FROM task_records
WHERE status IN ('completed', 'failed', 'cancelled')
  AND completed_at_ms < ?1
",
                    params![cutoff_ms],
                )
                .storage("prune_expired")?;
            Ok(deleted)
        })
    }
}

trait SqliteResultExt<T> {
    fn storage(self, operation: &str) -> PersistenceResult<T>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn storage(self, operation: &str) -> PersistenceResult<T> {
        self.map_err(|error| storage_error(operation, error))
    }
}

fn select_record(
    connection: &Connection,
    task_id: &TaskId,
) -> rusqlite::Result<Option<TaskRecord>> {
    connection
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
            [task_id.as_str()],
            read_record,
        )
        .optional()
}

fn write_record(connection: &Connection, record: &TaskRecord) -> rusqlite::Result<usize> {
    let result_json = record
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| {
            storage_error_sqlite(&format!("failed to serialize task result: {error}"))
        })?;

    connection.execute(
        "
UPDATE task_records
SET func_name = ?2, status = ?3, created_at_ms = ?4, started_at_ms = ?5,
    completed_at_ms = ?6, result_json = ?7, error_message = ?8
WHERE task_id = ?1
",
        params![
            record.task_id.as_str(),
            record.func_name,
            record.status.as_str(),
            to_unix_millis(record.created_at)?,
            record.started_at.map(to_unix_millis).transpose()?,
            record.completed_at.map(to_unix_millis).transpose()?,
            result_json,
            record.error,
        ],
    )
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_id: String = row.get(0)?;
    let func_name: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let created_at_ms: i64 = row.get(3)?;
    let started_at_ms: Option<i64> = row.get(4)?;
    let completed_at_ms: Option<i64> = row.get(5)?;
    let result_json: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;

    Ok(TaskRecord {
        task_id: TaskId(task_id),
        func_name,
        status: parse_task_status(&status_raw)?,
        created_at: from_unix_millis(created_at_ms)?,
        started_at: started_at_ms.map(from_unix_millis).transpose()?,
        completed_at: completed_at_ms.map(from_unix_millis).transpose()?,
        result: result_json.as_deref().map(parse_result).transpose()?,
        error,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> PersistenceResult<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_text(
            "apply_migration",
            format!("migration version '{version}' is not defined"),
        )
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| {
        storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record"))
    })
}

fn parse_result(raw: &str) -> rusqlite::Result<TaskValue> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("corrupt task result json: {error}")))
}

fn truncate_to_millis(value: SystemTime) -> SystemTime {
    match value.duration_since(UNIX_EPOCH) {
        Ok(duration) => {
            UNIX_EPOCH + Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(0))
        }
        Err(_) => UNIX_EPOCH,
    }
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp milliseconds exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn not_found(task_id: &TaskId) -> TaskError {
    TaskError::for_task(
        TaskErrorKind::NotFound,
        task_id,
        format!("unknown task id '{task_id}'"),
    )
}

fn storage_error(operation: &str, error: rusqlite::Error) -> TaskError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> TaskError {
    TaskError::new(
        TaskErrorKind::StoreUnavailable,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
