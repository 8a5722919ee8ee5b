//! Database drivers.
//!
//! A driver knows how to apply one migration against a specific backing
//! store and record its version. Concrete drivers register themselves in a
//! process-level registry keyed by URL scheme; [`connect`] picks the right
//! one from a connection URL.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::lock::Lockable;
use crate::models::Migration;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub const DEFAULT_MIGRATIONS_TABLE: &str = "db_migrations";
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: i64 = 60;
pub const DEFAULT_MIGRATION_MAX_SIZE: usize = 10 * 1 << 20; // 10 MiB

/// First line that switches a migration body to non-transactional execution,
/// for DDL that refuses to run inside a transaction.
pub const NONTRANSACTIONAL_DIRECTIVE: &str = "-- morph:nontransactional\n";

/// A value accepted by [`Driver::set_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> ConfigValue {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> ConfigValue {
        ConfigValue::Str(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> ConfigValue {
        ConfigValue::Int(value)
    }
}

/// Configuration shared by every driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub migrations_table: String,
    pub statement_timeout_secs: i64,
    pub migration_max_size: usize,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            statement_timeout_secs: DEFAULT_STATEMENT_TIMEOUT_SECS,
            migration_max_size: DEFAULT_MIGRATION_MAX_SIZE,
        }
    }
}

impl DriverConfig {
    pub(crate) fn set(
        &mut self,
        driver: &'static str,
        key: &str,
        value: ConfigValue,
    ) -> Result<(), Error> {
        match (key, value) {
            ("MigrationsTable", ConfigValue::Str(name)) => {
                self.migrations_table = name;
                Ok(())
            }
            ("StatementTimeoutInSecs", ConfigValue::Int(n)) => {
                self.statement_timeout_secs = n;
                Ok(())
            }
            ("MigrationsTable", _) | ("StatementTimeoutInSecs", _) => Err(Error::app(
                driver,
                format!("incorrect value type for {key}"),
            )),
            _ => Err(Error::app(driver, format!("incorrect key name {key:?}"))),
        }
    }

    /// Applies `x-…` connection URL parameters on top of the defaults.
    pub(crate) fn merge_url_params(
        &mut self,
        driver: &'static str,
        params: &HashMap<String, String>,
    ) -> Result<(), Error> {
        for (key, value) in params {
            match key.as_str() {
                "x-migrations-table" => self.migrations_table = value.clone(),
                "x-statement-timeout" => {
                    self.statement_timeout_secs = value.parse().map_err(|_| {
                        Error::app(driver, format!("failed to cast config param {key} of {value}"))
                    })?;
                }
                "x-migration-max-size" => {
                    self.migration_max_size = value.parse().map_err(|_| {
                        Error::app(driver, format!("failed to cast config param {key} of {value}"))
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn check_size(&self, migration: &Migration) -> Result<(), Error> {
        if migration.bytes.len() > self.migration_max_size {
            return Err(Error::MigrationTooLarge {
                name: migration.raw_name.clone(),
                size: migration.bytes.len(),
                max: self.migration_max_size,
            });
        }
        Ok(())
    }
}

/// Custom parameter names recognized on connection URLs.
const CONFIG_PARAMS: [&str; 3] = [
    "x-migration-max-size",
    "x-migrations-table",
    "x-statement-timeout",
];

/// Splits the recognized `x-…` parameters out of a connection URL, returning
/// the sanitized URL the backend client actually dials.
pub(crate) fn extract_custom_params(raw: &str) -> (String, HashMap<String, String>) {
    let Some((base, query)) = raw.split_once('?') else {
        return (raw.to_string(), HashMap::new());
    };

    let mut params = HashMap::new();
    let mut kept = url::form_urlencoded::Serializer::new(String::new());
    let mut kept_any = false;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if CONFIG_PARAMS.contains(&key.as_ref()) {
            params.insert(key.into_owned(), value.into_owned());
        } else {
            kept.append_pair(&key, &value);
            kept_any = true;
        }
    }

    let sanitized = if kept_any {
        format!("{}?{}", base, kept.finish())
    } else {
        base.to_string()
    };

    (sanitized, params)
}

/// Returns the remainder of a migration body that opted out of transactional
/// execution, or `None` when the body should run inside a transaction.
pub(crate) fn strip_nontransactional_directive(body: &str) -> Option<&str> {
    body.strip_prefix(NONTRANSACTIONAL_DIRECTIVE)
}

pub trait Driver: Send {
    /// Short name of the backing dialect, e.g. `"sqlite"`.
    fn name(&self) -> &'static str;

    /// Health check bounded by the statement timeout.
    fn ping(&mut self) -> Result<(), Error>;

    /// Rows from the migrations table, sorted ascending by version. The
    /// first call creates the table if it is absent.
    fn applied_migrations(&mut self) -> Result<Vec<Migration>, Error>;

    /// Executes one migration and, when `save_version` is set, records or
    /// removes its version row. See the module docs for the transactional
    /// contract.
    fn apply(&mut self, migration: &Migration, save_version: bool) -> Result<(), Error>;

    /// Recognized keys: `"MigrationsTable"` and `"StatementTimeoutInSecs"`.
    fn set_config(&mut self, key: &str, value: ConfigValue) -> Result<(), Error>;

    /// Releases the underlying connection(s). Idempotent.
    fn close(&mut self) -> Result<(), Error>;

    /// Drivers that can host the cross-process mutex return their
    /// [`Lockable`] capability here.
    fn lockable(&self) -> Option<&dyn Lockable> {
        None
    }
}

pub type DriverFactory = fn(&str) -> Result<Box<dyn Driver>, Error>;

static DRIVERS: Lazy<RwLock<HashMap<&'static str, DriverFactory>>> = Lazy::new(|| {
    #[allow(unused_mut)]
    let mut registered: HashMap<&'static str, DriverFactory> = HashMap::new();
    #[cfg(feature = "sqlite")]
    {
        let factory: DriverFactory = |url| Ok(Box::new(sqlite::SqliteDriver::open(url)?));
        registered.insert("sqlite", factory);
    }
    #[cfg(feature = "postgres")]
    {
        let factory: DriverFactory = |url| Ok(Box::new(postgres::PostgresDriver::open(url)?));
        registered.insert("postgres", factory);
        registered.insert("postgresql", factory);
    }
    #[cfg(feature = "mysql")]
    {
        let factory: DriverFactory = |url| Ok(Box::new(mysql::MysqlDriver::open(url)?));
        registered.insert("mysql", factory);
    }
    RwLock::new(registered)
});

/// Registers a driver factory under a URL scheme.
pub fn register(scheme: &'static str, factory: DriverFactory) {
    DRIVERS.write().unwrap().insert(scheme, factory);
}

/// Connects a driver selected by the URL scheme, e.g.
/// `postgres://user@host/db` or `sqlite:///var/lib/app/state.db`.
pub fn connect(url: &str) -> Result<Box<dyn Driver>, Error> {
    let scheme = url.split("://").next().filter(|s| *s != url);
    let scheme =
        scheme.ok_or_else(|| Error::app("driver", format!("unsupported driver URL {url:?}")))?;

    let factory = {
        let drivers = DRIVERS.read().unwrap();
        drivers.get(scheme).copied()
    };

    match factory {
        Some(factory) => factory(url),
        None => Err(Error::app(
            "driver",
            format!("unsupported driver {scheme:?} found"),
        )),
    }
}
