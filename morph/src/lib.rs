//! `morph` is a database schema migration engine.
//!
//! It applies an ordered set of schema-change scripts to a relational
//! database, records which versions have been applied, supports controlled
//! rollback, and coordinates concurrent migrators across processes so that
//! only one actor mutates schema at a time. It is meant to be embedded in
//! application startup code as a library, and is also driven by the `morph`
//! operator CLI.
//!
//! # Core concepts
//!
//! - A [`Migration`] is an immutable `(version, name, direction, script)`
//!   record, usually parsed from a filename like `000003_add_posts.up.sql`.
//! - A [`Source`](sources::Source) supplies the full catalog of available
//!   migrations in both directions. Sources discover and parse; the engine
//!   orders and diffs.
//! - A [`Driver`](drivers::Driver) executes one migration against a specific
//!   backing store, transactionally where the dialect allows it, and records
//!   the version row in the same transaction.
//! - The [`Migrator`] diffs source against applied, drives the
//!   apply/rollback loop, and executes [`Plan`]s with partial-failure
//!   compensation.
//! - A [`Locker`](lock::Locker) is a leased database-backed mutex that
//!   serializes migrators across processes, with lease renewal and
//!   expiry-based takeover.
//!
//! # Example
//!
//! ```
//! use morph::drivers::sqlite::SqliteDriver;
//! use morph::sources::EmbeddedSource;
//! use morph::{CancellationToken, Migrator};
//!
//! let driver = SqliteDriver::open_in_memory().unwrap();
//! let source = EmbeddedSource::new([
//!     (
//!         "000001_create_users.up.sql",
//!         &b"CREATE TABLE users (id integer primary key);"[..],
//!     ),
//!     ("000001_create_users.down.sql", &b"DROP TABLE users;"[..]),
//! ])
//! .unwrap();
//!
//! let mut engine = Migrator::builder(driver, source)
//!     .build(&CancellationToken::new())
//!     .unwrap();
//!
//! let report = engine.apply_all().unwrap();
//! assert_eq!(report.count(), 1);
//! assert!(report.failure.is_none());
//!
//! engine.close().unwrap();
//! ```
//!
//! # Database support
//!
//! - SQLite, with the `sqlite` feature flag (on by default).
//! - PostgreSQL, with the `postgres` feature flag.
//! - MySQL, with the `mysql` feature flag.
//!
//! Drivers register themselves by URL scheme, so
//! [`drivers::connect`]`("postgres://…")` picks the right one at runtime.
//! Every driver with a shared backing store also hosts the cross-process
//! mutex; enable it with [`MigratorBuilder::lock_key`].
//!
//! # Non-transactional migrations
//!
//! Some DDL cannot run inside a transaction (`CREATE INDEX CONCURRENTLY`
//! being the classic case). A migration whose first line is exactly
//! `-- morph:nontransactional` is executed outside a transaction, and its
//! version row is recorded by a separate follow-up statement.

mod error;
pub use error::Error;

mod macros;

mod models;
pub use models::{Direction, Migration, Plan, CURRENT_PLAN_VERSION};

mod migrator;
pub use migrator::{
    swap_plan_direction, Interceptor, InterceptorError, MigrationFailure, MigrationReport,
    Migrator, MigratorBuilder,
};

pub mod drivers;
pub mod lock;
pub mod sources;

pub use lock::CancellationToken;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(all(test, feature = "sqlite"))]
mod test_sqlite;
