//! End-to-end scenarios against a real SQLite database.

use std::time::Duration;

use crate::drivers::sqlite::SqliteDriver;
use crate::drivers::Driver;
use crate::lock::CancellationToken;
use crate::models::Direction;
use crate::sources::FileSource;
use crate::testing::basic_source;
use crate::{Error, Migrator};

fn temp_db() -> tempfile::NamedTempFile {
    tempfile::NamedTempFile::new().unwrap()
}

fn driver_for(file: &tempfile::NamedTempFile) -> SqliteDriver {
    SqliteDriver::open(file.path().to_str().unwrap()).unwrap()
}

fn table_exists(file: &tempfile::NamedTempFile, name: &str) -> bool {
    let conn = rusqlite::Connection::open(file.path()).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )
        .unwrap();
    count > 0
}

#[test]
fn sequence_apply_then_rollback() {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in [
        ("000001_a.up.sql", "CREATE TABLE table_a (id integer);"),
        ("000001_a.down.sql", "DROP TABLE table_a;"),
        ("000002_b.up.sql", "CREATE TABLE table_b (id integer);"),
        ("000002_b.down.sql", "DROP TABLE table_b;"),
        ("000003_c.up.sql", "CREATE TABLE table_c (id integer);"),
        ("000003_c.down.sql", "DROP TABLE table_c;"),
    ] {
        std::fs::write(dir.path().join(name), body).unwrap();
    }

    let db = temp_db();
    let mut engine = Migrator::builder(
        driver_for(&db),
        FileSource::open(dir.path()).unwrap(),
    )
    .build(&CancellationToken::new())
    .unwrap();

    let report = engine.apply_all().unwrap();
    assert_eq!(report.applied, vec!["a", "b", "c"]);

    let applied = engine.applied().unwrap();
    let pairs: Vec<(u32, &str)> = applied
        .iter()
        .map(|m| (m.version, m.name.as_str()))
        .collect();
    assert_eq!(pairs, vec![(1, "a"), (2, "b"), (3, "c")]);
    assert!(table_exists(&db, "table_a"));
    assert!(table_exists(&db, "table_c"));

    let report = engine.apply_down(-1).unwrap();
    assert_eq!(report.applied, vec!["c", "b", "a"]);
    assert!(engine.applied().unwrap().is_empty());
    assert!(!table_exists(&db, "table_a"));
    assert!(!table_exists(&db, "table_c"));

    engine.close().unwrap();
}

#[test]
fn failed_plan_compensates_against_a_real_database() {
    let source = crate::inline_migrations![
        "000001_a.up.sql" => b"CREATE TABLE table_a (id integer);",
        "000001_a.down.sql" => b"DROP TABLE table_a;",
        "000002_b.up.sql" => b"CREATE TABLE table_b (id integer);",
        "000002_b.down.sql" => b"DROP TABLE table_b;",
        "000003_c.up.sql" => b"bleep blorp;",
        "000003_c.down.sql" => b"SELECT 1;",
    ];

    let db = temp_db();
    let mut engine = Migrator::builder(driver_for(&db), source)
        .build(&CancellationToken::new())
        .unwrap();

    let before = engine.applied().unwrap();
    let plan_steps = engine.diff(Direction::Up).unwrap();
    let plan = engine.generate_plan(plan_steps, true).unwrap();

    let err = engine.apply_plan(&plan).unwrap_err();
    assert!(matches!(err, Error::PlanFailed(_)));
    assert!(err.is_database());

    // No partial forward progress survives compensation.
    assert_eq!(engine.applied().unwrap(), before);
    assert!(!table_exists(&db, "table_a"));
    assert!(!table_exists(&db, "table_b"));

    engine.close().unwrap();
}

#[test]
fn applied_set_matches_raw_name_order() {
    let db = temp_db();
    let mut engine = Migrator::builder(driver_for(&db), basic_source(5))
        .build(&CancellationToken::new())
        .unwrap();

    let report = engine.apply_all().unwrap();
    assert!(report.failure.is_none());

    let expected: Vec<String> = (0..5)
        .map(|i| format!("migration_{}", (b'a' + i as u8) as char))
        .collect();
    assert_eq!(report.applied, expected);
    engine.close().unwrap();
}

#[test]
fn engines_contend_on_the_lock_key() {
    let db = temp_db();

    let mut holder = Migrator::builder(driver_for(&db), basic_source(1))
        .lock_key("mk")
        .build(&CancellationToken::new())
        .unwrap();

    // A second engine cannot acquire the mutex while it is held.
    let token = CancellationToken::new();
    let canceller = token.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        canceller.cancel();
    });
    let blocked = Migrator::builder(driver_for(&db), basic_source(1))
        .lock_key("mk")
        .build(&token);
    assert!(matches!(blocked, Err(Error::LockUnavailable)));

    // Closing the holder releases the lease and lets a newcomer in.
    holder.close().unwrap();
    let mut replacement = Migrator::builder(driver_for(&db), basic_source(1))
        .lock_key("mk")
        .build(&CancellationToken::new())
        .unwrap();
    replacement.close().unwrap();
}

#[test]
fn expired_leases_do_not_block_new_engines() {
    let db = temp_db();

    {
        let driver = driver_for(&db);
        let lockable = driver.lockable().unwrap();
        let mut session = lockable.open_lock_session().unwrap();
        assert!(session.try_insert("mk", 1).unwrap());
    }

    let started = std::time::Instant::now();
    let mut engine = Migrator::builder(driver_for(&db), basic_source(1))
        .lock_key("mk")
        .build(&CancellationToken::new())
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let driver = driver_for(&db);
    let mut session = driver.lockable().unwrap().open_lock_session().unwrap();
    let expiry = session.read_expiry("mk").unwrap().unwrap();
    assert!(expiry > chrono::Utc::now().timestamp());

    engine.close().unwrap();
}

#[test]
fn interceptors_guard_real_migrations() {
    let db = temp_db();
    let mut engine = Migrator::builder(driver_for(&db), basic_source(2))
        .build(&CancellationToken::new())
        .unwrap();

    engine.add_interceptor(2, Direction::Up, || Err("hold the phone".into()));
    let report = engine.apply_all().unwrap();
    assert_eq!(report.applied, vec!["migration_a"]);
    assert!(report.failure.is_some());
    assert!(table_exists(&db, "table_a"));
    assert!(!table_exists(&db, "table_b"));
    engine.close().unwrap();
}
