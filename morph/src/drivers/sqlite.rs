//! SQLite driver, backed by [`rusqlite`].
//!
//! SQLite supports transactional DDL, so a failed migration body rolls back
//! completely unless it opted out with the non-transactional directive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use crate::drivers::{
    extract_custom_params, strip_nontransactional_directive, ConfigValue, Driver, DriverConfig,
};
use crate::error::Error;
use crate::lock::{LockStore, Lockable, MUTEX_TABLE_NAME};
use crate::models::{Direction, Migration};

const DRIVER_NAME: &str = "sqlite";

pub struct SqliteDriver {
    conn: Option<Connection>,
    path: Option<PathBuf>,
    config: DriverConfig,
    busy: Arc<AtomicBool>,
}

impl SqliteDriver {
    /// Opens a driver over an existing database file. The URL may carry the
    /// `x-migrations-table`, `x-statement-timeout` and `x-migration-max-size`
    /// parameters, and accepts an optional `sqlite://` scheme prefix.
    pub fn open(url: &str) -> Result<SqliteDriver, Error> {
        let (sanitized, params) = extract_custom_params(url);
        let path = sanitized
            .strip_prefix("sqlite://")
            .unwrap_or(&sanitized)
            .to_string();

        let mut config = DriverConfig::default();
        config.merge_url_params(DRIVER_NAME, &params)?;

        if !std::path::Path::new(&path).exists() {
            return Err(Error::app(
                DRIVER_NAME,
                format!("failed to open db file {path:?}: no such file"),
            ));
        }

        let conn = Connection::open(&path).map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "opening_connection",
                "failed to open connection with the database",
                err,
            )
        })?;
        apply_busy_timeout(&conn, config.statement_timeout_secs)?;

        Ok(SqliteDriver {
            conn: Some(conn),
            path: Some(PathBuf::from(path)),
            config,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Opens a driver over a private in-memory database. Such a driver
    /// cannot host the cross-process mutex.
    pub fn open_in_memory() -> Result<SqliteDriver, Error> {
        let conn = Connection::open_in_memory().map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "opening_connection",
                "failed to open in-memory database",
                err,
            )
        })?;
        Ok(SqliteDriver {
            conn: Some(conn),
            path: None,
            config: DriverConfig::default(),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    fn conn(&mut self) -> Result<&mut Connection, Error> {
        self.conn.as_mut().ok_or(Error::NotConnected(DRIVER_NAME))
    }

    /// Serializes table creation and applies against concurrent callers in
    /// this process. Cross-process exclusion is the mutex's job.
    fn local_lock(&self) -> Result<LocalGuard, Error> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::database(
                DRIVER_NAME,
                "lock_driver",
                "failed to obtain lock",
                std::io::Error::new(std::io::ErrorKind::WouldBlock, "already locked"),
            ));
        }
        Ok(LocalGuard {
            flag: Arc::clone(&self.busy),
        })
    }

    fn create_schema_table_if_not_exists(&mut self) -> Result<(), Error> {
        let table = self.config.migrations_table.clone();
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {table} (Version bigint not null primary key, Name varchar not null)"
        );
        self.conn()?.execute_batch(&query).map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "create_migrations_table_if_not_exists",
                "failed while executing query",
                err,
            )
            .with_query(query)
        })
    }

    fn save_version(conn: &Connection, table: &str, migration: &Migration) -> Result<(), Error> {
        let (query, command): (String, &'static str) = match migration.direction {
            Direction::Up => (
                format!("INSERT INTO {table} (Version, Name) VALUES (?1, ?2)"),
                "save_version",
            ),
            Direction::Down => (
                format!("DELETE FROM {table} WHERE Version = ?1 AND Name = ?2"),
                "delete_version",
            ),
        };
        conn.execute(&query, rusqlite::params![migration.version, migration.name])
            .map_err(|err| {
                Error::database(DRIVER_NAME, command, "failed to update version row", err)
                    .with_query(query)
            })?;
        Ok(())
    }
}

struct LocalGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn apply_busy_timeout(conn: &Connection, timeout_secs: i64) -> Result<(), Error> {
    conn.busy_timeout(Duration::from_secs(timeout_secs.max(0) as u64))
        .map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "set_busy_timeout",
                "failed to set busy timeout",
                err,
            )
        })
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.conn()?
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|err| {
                Error::database(DRIVER_NAME, "ping", "failed to ping the database", err)
            })
    }

    fn applied_migrations(&mut self) -> Result<Vec<Migration>, Error> {
        if self.conn.is_none() {
            return Err(Error::NotConnected(DRIVER_NAME));
        }

        let _guard = self.local_lock()?;
        self.create_schema_table_if_not_exists()?;

        let query = format!(
            "SELECT Version, Name FROM {} ORDER BY Version ASC",
            self.config.migrations_table
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query).map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "select_applied_migrations",
                "failed to fetch applied migrations",
                err,
            )
            .with_query(query.clone())
        })?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Migration {
                    version: row.get(0)?,
                    name: row.get(1)?,
                    raw_name: String::new(),
                    direction: Direction::Up,
                    bytes: Vec::new(),
                })
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|err| {
                Error::database(
                    DRIVER_NAME,
                    "scan_applied_migrations",
                    "failed to scan applied migration row",
                    err,
                )
            })?;

        Ok(rows)
    }

    fn apply(&mut self, migration: &Migration, save_version: bool) -> Result<(), Error> {
        let _guard = self.local_lock()?;
        self.config.check_size(migration)?;

        let table = self.config.migrations_table.clone();
        let body = migration.script()?.to_string();
        let conn = self.conn.as_mut().ok_or(Error::NotConnected(DRIVER_NAME))?;

        if strip_nontransactional_directive(&body).is_some() {
            // The body runs in autocommit mode; the version row follows as a
            // separate statement with no atomicity between the two.
            conn.execute_batch(&body).map_err(|err| Error::ApplyFailed {
                name: migration.name.clone(),
                query: body.clone(),
                source: Box::new(err),
            })?;
            if save_version {
                Self::save_version(conn, &table, migration)?;
            }
            return Ok(());
        }

        let tx = conn.transaction().map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "begin_transaction",
                "error while opening a transaction to the database",
                err,
            )
        })?;

        // Rolls back via the transaction guard on any error below.
        tx.execute_batch(&body).map_err(|err| Error::ApplyFailed {
            name: migration.name.clone(),
            query: body.clone(),
            source: Box::new(err),
        })?;

        if save_version {
            Self::save_version(&tx, &table, migration)?;
        }

        tx.commit().map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "commit_transaction",
                "error while committing a transaction to the database",
                err,
            )
        })
    }

    fn set_config(&mut self, key: &str, value: ConfigValue) -> Result<(), Error> {
        self.config.set(DRIVER_NAME, key, value)?;
        if key == "StatementTimeoutInSecs" {
            if let Some(conn) = self.conn.as_ref() {
                apply_busy_timeout(conn, self.config.statement_timeout_secs)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| {
                Error::database(
                    DRIVER_NAME,
                    "sqlite_conn_close",
                    "failed to close database connection",
                    err,
                )
            })?;
        }
        Ok(())
    }

    fn lockable(&self) -> Option<&dyn Lockable> {
        Some(self)
    }
}

impl Lockable for SqliteDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn open_lock_session(&self) -> Result<Box<dyn LockStore>, Error> {
        let path = self.path.as_ref().ok_or_else(|| {
            Error::app(
                DRIVER_NAME,
                "an in-memory database cannot host a cross-process mutex",
            )
        })?;

        let conn = Connection::open(path).map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "opening_connection",
                "failed to open lock session",
                err,
            )
        })?;
        apply_busy_timeout(&conn, self.config.statement_timeout_secs)?;

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {MUTEX_TABLE_NAME} (Id varchar not null primary key, ExpireAt bigint)"
        );
        conn.execute_batch(&create).map_err(|err| {
            Error::database(
                DRIVER_NAME,
                "create_lock_table_if_not_exists",
                "failed while executing query",
                err,
            )
            .with_query(create)
        })?;

        Ok(Box::new(SqliteLockStore { conn }))
    }
}

struct SqliteLockStore {
    conn: Connection,
}

impl LockStore for SqliteLockStore {
    fn try_insert(&mut self, key: &str, expire_at: i64) -> Result<bool, Error> {
        let query =
            format!("INSERT OR IGNORE INTO {MUTEX_TABLE_NAME} (Id, ExpireAt) VALUES (?1, ?2)");
        let changed = self
            .conn
            .execute(&query, rusqlite::params![key, expire_at])
            .map_err(|err| {
                Error::database(DRIVER_NAME, "insert_lock", "failed to insert lock row", err)
                    .with_query(query)
            })?;
        Ok(changed > 0)
    }

    fn read_expiry(&mut self, key: &str) -> Result<Option<i64>, Error> {
        let query = format!("SELECT ExpireAt FROM {MUTEX_TABLE_NAME} WHERE Id = ?1");
        self.conn
            .query_row(&query, rusqlite::params![key], |row| row.get(0))
            .optional()
            .map_err(|err| {
                Error::database(DRIVER_NAME, "read_lock", "failed to read lock row", err)
                    .with_query(query)
            })
    }

    fn refresh(&mut self, key: &str, observed: i64, expire_at: i64) -> Result<bool, Error> {
        let query = format!(
            "UPDATE {MUTEX_TABLE_NAME} SET ExpireAt = ?1 WHERE Id = ?2 AND ExpireAt = ?3"
        );
        let changed = self
            .conn
            .execute(&query, rusqlite::params![expire_at, key, observed])
            .map_err(|err| {
                Error::database(DRIVER_NAME, "refresh_lock", "failed to refresh lock row", err)
                    .with_query(query)
            })?;
        Ok(changed > 0)
    }

    fn delete(&mut self, key: &str) -> Result<(), Error> {
        let query = format!("DELETE FROM {MUTEX_TABLE_NAME} WHERE Id = ?1");
        self.conn
            .execute(&query, rusqlite::params![key])
            .map_err(|err| {
                Error::database(DRIVER_NAME, "delete_lock", "failed to delete lock row", err)
                    .with_query(query)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{refresh_lease, CancellationToken, Locker, Mutex};

    fn temp_driver() -> (tempfile::NamedTempFile, SqliteDriver) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let driver = SqliteDriver::open(file.path().to_str().unwrap()).unwrap();
        (file, driver)
    }

    fn migration(raw_name: &str, body: &str) -> Migration {
        Migration::from_file(raw_name, body.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn applied_migrations_creates_table_idempotently() {
        let (_file, mut driver) = temp_driver();
        assert!(driver.applied_migrations().unwrap().is_empty());
        assert!(driver.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn apply_records_version_inside_the_transaction() {
        let (_file, mut driver) = temp_driver();
        driver.applied_migrations().unwrap();

        let m = migration("000001_users.up.sql", "CREATE TABLE users (id integer);");
        driver.apply(&m, true).unwrap();

        let applied = driver.applied_migrations().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].version, 1);
        assert_eq!(applied[0].name, "users");
    }

    #[test]
    fn apply_without_save_version_skips_bookkeeping() {
        let (_file, mut driver) = temp_driver();
        let m = migration("000001_users.up.sql", "CREATE TABLE users (id integer);");
        driver.apply(&m, false).unwrap();
        assert!(driver.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn down_migration_removes_the_version_row() {
        let (_file, mut driver) = temp_driver();
        let up = migration("000001_users.up.sql", "CREATE TABLE users (id integer);");
        let down = migration("000001_users.down.sql", "DROP TABLE users;");

        driver.apply(&up, true).unwrap();
        driver.apply(&down, true).unwrap();
        assert!(driver.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn applied_rows_are_sorted_by_version() {
        let (_file, mut driver) = temp_driver();
        for raw in [
            "000003_c.up.sql",
            "000001_a.up.sql",
            "000002_b.up.sql",
        ] {
            driver
                .apply(&migration(raw, "SELECT 1;"), true)
                .unwrap();
        }

        let versions: Vec<u32> = driver
            .applied_migrations()
            .unwrap()
            .iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn failed_body_rolls_back_the_whole_batch() {
        let (_file, mut driver) = temp_driver();
        let m = migration(
            "000001_broken.up.sql",
            "CREATE TABLE half_done (id integer);\nbleep blorp;",
        );

        let err = driver.apply(&m, true).unwrap_err();
        assert!(matches!(err, Error::ApplyFailed { .. }));
        assert!(err.is_database());

        // The first statement must not have survived.
        let conn = Connection::open(driver.path.as_ref().unwrap()).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='half_done'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
        assert!(driver.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn nontransactional_directive_runs_outside_a_transaction() {
        let (_file, mut driver) = temp_driver();
        let m = migration(
            "000001_nt.up.sql",
            "-- morph:nontransactional\nCREATE TABLE nt (id integer);",
        );
        driver.apply(&m, true).unwrap();

        let applied = driver.applied_migrations().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "nt");

        let conn = Connection::open(driver.path.as_ref().unwrap()).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='nt'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn nontransactional_failure_keeps_earlier_statements() {
        let (_file, mut driver) = temp_driver();
        let m = migration(
            "000001_nt.up.sql",
            "-- morph:nontransactional\nCREATE TABLE survivor (id integer);\nbleep blorp;",
        );
        assert!(driver.apply(&m, true).is_err());

        // Autocommit mode: the statement before the failure persists, and no
        // version row was recorded.
        let conn = Connection::open(driver.path.as_ref().unwrap()).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='survivor'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(driver.applied_migrations().unwrap().is_empty());
    }

    #[test]
    fn oversized_migrations_are_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("{}?x-migration-max-size=16", file.path().display());
        let mut driver = SqliteDriver::open(&url).unwrap();

        let m = migration(
            "000001_big.up.sql",
            "CREATE TABLE big (id integer, padding varchar);",
        );
        match driver.apply(&m, true) {
            Err(Error::MigrationTooLarge { max: 16, .. }) => {}
            other => panic!("expected MigrationTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn url_params_configure_the_driver() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let url = format!(
            "sqlite://{}?x-migrations-table=history&x-statement-timeout=3",
            file.path().display()
        );
        let mut driver = SqliteDriver::open(&url).unwrap();
        assert_eq!(driver.config.migrations_table, "history");
        assert_eq!(driver.config.statement_timeout_secs, 3);

        driver.applied_migrations().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='history'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn set_config_rejects_unknown_keys_and_types() {
        let (_file, mut driver) = temp_driver();
        driver
            .set_config("MigrationsTable", ConfigValue::from("other"))
            .unwrap();
        driver
            .set_config("StatementTimeoutInSecs", ConfigValue::from(2i64))
            .unwrap();
        assert!(driver
            .set_config("MigrationsTable", ConfigValue::from(1i64))
            .is_err());
        assert!(driver.set_config("Whatever", ConfigValue::from(1i64)).is_err());
    }

    #[test]
    fn open_requires_an_existing_file() {
        assert!(SqliteDriver::open("/no/such/database.db").is_err());
    }

    #[test]
    fn close_is_idempotent_and_poisons_operations() {
        let (_file, mut driver) = temp_driver();
        driver.close().unwrap();
        driver.close().unwrap();
        assert!(matches!(
            driver.applied_migrations(),
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(driver.ping(), Err(Error::NotConnected(_))));
    }

    #[test]
    fn in_memory_databases_cannot_host_the_mutex() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let lockable = driver.lockable().unwrap();
        assert!(lockable.open_lock_session().is_err());
    }

    // Mutex protocol tests run against the real lock table on a temp file.

    #[test]
    fn mutex_acquires_and_releases() {
        let (_file, driver) = temp_driver();
        let token = CancellationToken::new();
        let mut mutex = Mutex::open("mk", driver.lockable().unwrap()).unwrap();

        mutex.lock(&token).unwrap();

        let mut session = driver.lockable().unwrap().open_lock_session().unwrap();
        let expiry = session.read_expiry("mk").unwrap().unwrap();
        assert!(expiry > chrono::Utc::now().timestamp());

        mutex.unlock().unwrap();
        assert!(session.read_expiry("mk").unwrap().is_none());

        // Unlock is idempotent.
        mutex.unlock().unwrap();
    }

    #[test]
    fn expired_leases_are_taken_over() {
        let (_file, driver) = temp_driver();
        let lockable = driver.lockable().unwrap();

        let mut session = lockable.open_lock_session().unwrap();
        assert!(session.try_insert("mk", 1).unwrap());

        let started = std::time::Instant::now();
        let mut mutex = Mutex::open("mk", lockable).unwrap();
        mutex.lock(&CancellationToken::new()).unwrap();

        // A stale lease is stolen on the first protocol iteration.
        assert!(started.elapsed() < Duration::from_secs(2));
        let expiry = session.read_expiry("mk").unwrap().unwrap();
        assert!(expiry > chrono::Utc::now().timestamp());
        mutex.unlock().unwrap();
    }

    #[test]
    fn contending_holders_never_overlap() {
        let (_file, driver) = temp_driver();
        let lockable = driver.lockable().unwrap();

        let mut first = Mutex::open("mk", lockable).unwrap();
        let mut second = Mutex::open("mk", lockable).unwrap();

        first.lock(&CancellationToken::new()).unwrap();

        let held = std::sync::Arc::new(AtomicBool::new(true));
        let held_by_first = held.clone();
        let contender = std::thread::spawn(move || {
            second.lock(&CancellationToken::new()).unwrap();
            let overlap = held_by_first.load(Ordering::SeqCst);
            second.unlock().unwrap();
            overlap
        });

        std::thread::sleep(Duration::from_millis(300));
        held.store(false, Ordering::SeqCst);
        first.unlock().unwrap();

        assert!(!contender.join().unwrap(), "both holders saw the lock held");
    }

    #[test]
    fn cancelled_acquisition_reports_lock_unavailable() {
        let (_file, driver) = temp_driver();
        let lockable = driver.lockable().unwrap();

        let mut holder = Mutex::open("mk", lockable).unwrap();
        holder.lock(&CancellationToken::new()).unwrap();

        let mut blocked = Mutex::open("mk", lockable).unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        match blocked.lock(&token) {
            Err(Error::LockUnavailable) => {}
            other => panic!("expected LockUnavailable, got {other:?}"),
        }
        holder.unlock().unwrap();
    }

    #[test]
    fn losing_the_lease_stops_renewal() {
        let (_file, driver) = temp_driver();
        let lockable = driver.lockable().unwrap();

        let mut session = lockable.open_lock_session().unwrap();
        let granted = chrono::Utc::now().timestamp() + 15;
        assert!(session.try_insert("mk", granted).unwrap());

        // A peer steals the lease: the stored expiry no longer matches what
        // the holder last observed, so renewal must report the loss.
        assert!(session.refresh("mk", granted, granted + 100).unwrap());
        let renewed = refresh_lease(session.as_mut(), "mk", granted).unwrap();
        assert!(renewed.is_none());

        // With the right observation the renewal succeeds again.
        let renewed = refresh_lease(session.as_mut(), "mk", granted + 100).unwrap();
        assert!(renewed.is_some());
    }
}
