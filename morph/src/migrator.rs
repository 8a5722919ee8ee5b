//! The migration engine.
//!
//! A [`Migrator`] owns a [`Driver`] and a [`Source`], reconciles the applied
//! set against the source catalog, and drives the apply/rollback loop. It is
//! a single-owner object: one caller invokes its operations at a time, and
//! migrations run strictly sequentially on the caller's thread.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use crate::drivers::{ConfigValue, Driver};
use crate::error::Error;
use crate::lock::{CancellationToken, Locker, Mutex};
use crate::models::{Direction, Migration, Plan};
use crate::sources::Source;

pub type InterceptorError = Box<dyn std::error::Error + Send + Sync>;

/// A handler invoked just before a specific migration is applied. Returning
/// an error aborts the migration before any transaction is started.
pub type Interceptor = Arc<dyn Fn() -> Result<(), InterceptorError> + Send + Sync>;

/// Outcome of an [`Migrator::apply`] or [`Migrator::apply_down`] run: the
/// migrations completed so far, and the failure that stopped the loop, if
/// any.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Names of the migrations applied, in apply order.
    pub applied: Vec<String>,
    pub failure: Option<MigrationFailure>,
}

#[derive(Debug)]
pub struct MigrationFailure {
    pub name: String,
    pub error: Error,
}

impl MigrationReport {
    pub fn count(&self) -> usize {
        self.applied.len()
    }

    /// Collapses the report into a plain result, for callers that only care
    /// whether everything went through.
    pub fn into_result(self) -> Result<usize, Error> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self.applied.len()),
        }
    }
}

#[derive(Default)]
struct InterceptorMaps {
    up: HashMap<u32, Interceptor>,
    down: HashMap<u32, Interceptor>,
}

pub struct MigratorBuilder {
    driver: Box<dyn Driver>,
    source: Box<dyn Source>,
    lock_key: Option<String>,
    dry_run: bool,
    migrations_table: Option<String>,
    statement_timeout_secs: Option<i64>,
}

impl MigratorBuilder {
    /// Names the cross-process mutex to hold for the lifetime of the engine.
    /// Requires a driver that supports locking.
    pub fn lock_key(mut self, key: impl Into<String>) -> MigratorBuilder {
        self.lock_key = Some(key.into());
        self
    }

    /// Log every step and advance bookkeeping without touching the database.
    pub fn dry_run(mut self, enable: bool) -> MigratorBuilder {
        self.dry_run = enable;
        self
    }

    pub fn migrations_table(mut self, name: impl Into<String>) -> MigratorBuilder {
        self.migrations_table = Some(name.into());
        self
    }

    pub fn statement_timeout_secs(mut self, secs: i64) -> MigratorBuilder {
        self.statement_timeout_secs = Some(secs);
        self
    }

    /// Applies driver configuration, pings the database and, when a lock key
    /// is set, acquires the cross-process mutex. The token cancels lock
    /// acquisition only; it is not threaded into statement execution.
    pub fn build(self, token: &CancellationToken) -> Result<Migrator, Error> {
        let mut driver = self.driver;

        if let Some(name) = self.migrations_table {
            driver.set_config("MigrationsTable", ConfigValue::Str(name))?;
        }
        if let Some(secs) = self.statement_timeout_secs {
            driver.set_config("StatementTimeoutInSecs", ConfigValue::Int(secs))?;
        }

        driver.ping()?;

        let mutex = match self.lock_key {
            Some(key) => {
                let mut mutex = {
                    let lockable = driver.lockable().ok_or_else(|| {
                        Error::app("engine", "driver does not support locking")
                    })?;
                    Mutex::open(&key, lockable)?
                };
                mutex.lock(token)?;
                Some(Box::new(mutex) as Box<dyn Locker>)
            }
            None => None,
        };

        Ok(Migrator {
            driver,
            source: self.source,
            dry_run: self.dry_run,
            mutex,
            interceptors: StdMutex::new(InterceptorMaps::default()),
            closed: false,
        })
    }
}

pub struct Migrator {
    driver: Box<dyn Driver>,
    source: Box<dyn Source>,
    dry_run: bool,
    mutex: Option<Box<dyn Locker>>,
    interceptors: StdMutex<InterceptorMaps>,
    closed: bool,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("dry_run", &self.dry_run)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Migrator {
    pub fn builder(
        driver: impl Driver + 'static,
        source: impl Source + 'static,
    ) -> MigratorBuilder {
        Migrator::builder_boxed(Box::new(driver), Box::new(source))
    }

    /// Like [`Migrator::builder`], for drivers and sources that were already
    /// resolved dynamically, e.g. through the URL registries.
    pub fn builder_boxed(driver: Box<dyn Driver>, source: Box<dyn Source>) -> MigratorBuilder {
        MigratorBuilder {
            driver,
            source,
            lock_key: None,
            dry_run: false,
            migrations_table: None,
            statement_timeout_secs: None,
        }
    }

    /// Applies all pending migrations.
    pub fn apply_all(&mut self) -> Result<MigrationReport, Error> {
        self.apply(-1)
    }

    /// Applies up to `limit` pending migrations upwards. A negative limit
    /// applies everything; a limit above the number of pending migrations is
    /// an error.
    pub fn apply(&mut self, limit: i64) -> Result<MigrationReport, Error> {
        let applied = self.driver.applied_migrations()?;
        let pending = compute_pending_migrations(&applied, &self.source.migrations())?;

        let mut migrations: Vec<Migration> = pending
            .into_iter()
            .filter(|m| m.direction == Direction::Up)
            .collect();
        sort_migrations(&mut migrations);

        let steps = resolve_steps(limit, migrations.len())?;
        Ok(self.run_steps(migrations.iter().take(steps)))
    }

    /// Rolls back up to `limit` applied migrations. A negative limit rolls
    /// back everything.
    pub fn apply_down(&mut self, limit: i64) -> Result<MigrationReport, Error> {
        let mut applied = self.driver.applied_migrations()?;
        reverse_sort_migrations(&mut applied);
        let down_scripts = find_down_scripts(&applied, self.source.migrations())?;

        let steps = resolve_steps(limit, applied.len())?;
        let ordered: Vec<&Migration> = applied
            .iter()
            .take(steps)
            .map(|m| &down_scripts[&m.name])
            .collect();
        Ok(self.run_steps(ordered.into_iter()))
    }

    /// The difference between the applied migrations and the source catalog:
    /// pending up migrations in apply order, or the down scripts for every
    /// applied migration in rollback order.
    pub fn diff(&mut self, direction: Direction) -> Result<Vec<Migration>, Error> {
        let applied = self.driver.applied_migrations()?;

        match direction {
            Direction::Down => {
                let mut applied = applied;
                reverse_sort_migrations(&mut applied);
                let down_scripts = find_down_scripts(&applied, self.source.migrations())?;
                Ok(applied
                    .iter()
                    .map(|m| down_scripts[&m.name].clone())
                    .collect())
            }
            Direction::Up => {
                let pending = compute_pending_migrations(&applied, &self.source.migrations())?;
                let mut migrations: Vec<Migration> = pending
                    .into_iter()
                    .filter(|m| m.direction == Direction::Up)
                    .collect();
                sort_migrations(&mut migrations);
                Ok(migrations)
            }
        }
    }

    /// Finds the opposite-direction partner in the source for each of the
    /// given migrations. All inputs must share one direction, and every one
    /// of them must have a partner.
    pub fn get_opposite_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<Vec<Migration>, Error> {
        let mut direction: Option<Direction> = None;
        let mut wanted: HashSet<&str> = HashSet::with_capacity(migrations.len());
        for migration in migrations {
            match direction {
                None => direction = Some(migration.direction),
                Some(d) if d != migration.direction => {
                    return Err(Error::MismatchedDirections)
                }
                Some(_) => {}
            }
            wanted.insert(migration.name.as_str());
        }

        let Some(direction) = direction else {
            return Ok(Vec::new());
        };

        let mut opposites = Vec::with_capacity(migrations.len());
        for migration in self.source.migrations() {
            if migration.direction == direction {
                continue;
            }
            if wanted.contains(migration.name.as_str()) {
                opposites.push(migration);
            }
        }

        if opposites.len() != migrations.len() {
            return Err(Error::NoOppositeFound);
        }

        Ok(opposites)
    }

    /// Builds a plan to apply `migrations` along with the matched
    /// compensating steps for a safe rollback.
    pub fn generate_plan(
        &self,
        migrations: Vec<Migration>,
        auto: bool,
    ) -> Result<Plan, Error> {
        let revert_migrations = self.get_opposite_migrations(&migrations)?;
        Ok(Plan::new(migrations, revert_migrations, auto))
    }

    /// Applies a plan step by step. With `auto` set, a failed step triggers
    /// the compensating migrations for everything already attempted, in
    /// reverse order; the original failure is surfaced once compensation
    /// completes, and a failing compensator is fatal.
    pub fn apply_plan(&mut self, plan: &Plan) -> Result<(), Error> {
        plan.validate()?;

        let mut revert_queue: Vec<&Migration> =
            Vec::with_capacity(plan.revert_migrations.len());
        let mut failure: Option<Error> = None;
        let mut fail_index = 0;

        for (i, migration) in plan.migrations.iter().enumerate() {
            if let Some(revert) = plan
                .revert_migrations
                .iter()
                .find(|r| r.name == migration.name && r.version == migration.version)
            {
                revert_queue.push(revert);
            }

            fail_index = i;
            if let Err(err) = self.apply_one(migration, true) {
                failure = Some(err);
                break;
            }
        }

        let Some(failure) = failure else {
            return Ok(());
        };

        if !plan.auto {
            return Err(failure);
        }

        tracing::warn!(
            name = %plan.migrations[fail_index].name,
            "migration failed, starting rollback"
        );

        for j in (0..revert_queue.len()).rev() {
            // The compensator partnered with the failed step must not touch
            // the version table: a failed up step never inserted its row,
            // and a failed down step never deleted its own.
            let skip_save = j == revert_queue.len() - 1;
            if let Err(err) = self.apply_one(revert_queue[j], !skip_save) {
                return Err(Error::RollbackFailed(Box::new(err)));
            }
            tracing::info!(name = %revert_queue[j].name, "successfully rolled back migration");
        }

        Err(Error::PlanFailed(Box::new(failure)))
    }

    /// The applied migrations, as recorded by the driver.
    pub fn applied(&mut self) -> Result<Vec<Migration>, Error> {
        self.driver.applied_migrations()
    }

    /// Registers a handler to run just before the migration with the given
    /// version and direction. Replaces any previous handler for that pair.
    pub fn add_interceptor(
        &self,
        version: u32,
        direction: Direction,
        handler: impl Fn() -> Result<(), InterceptorError> + Send + Sync + 'static,
    ) {
        let mut maps = self.interceptors.lock().unwrap();
        let handler: Interceptor = Arc::new(handler);
        match direction {
            Direction::Up => maps.up.insert(version, handler),
            Direction::Down => maps.down.insert(version, handler),
        };
    }

    pub fn remove_interceptor(&self, version: u32, direction: Direction) {
        let mut maps = self.interceptors.lock().unwrap();
        match direction {
            Direction::Up => maps.up.remove(&version),
            Direction::Down => maps.down.remove(&version),
        };
    }

    fn get_interceptor(&self, migration: &Migration) -> Option<Interceptor> {
        let maps = self.interceptors.lock().unwrap();
        match migration.direction {
            Direction::Up => maps.up.get(&migration.version).cloned(),
            Direction::Down => maps.down.get(&migration.version).cloned(),
        }
    }

    fn apply_one(&mut self, migration: &Migration, save_version: bool) -> Result<(), Error> {
        if let Some(interceptor) = self.get_interceptor(migration) {
            tracing::info!(name = %migration.name, "running pre-migration function");
            interceptor().map_err(|err| Error::Interceptor {
                name: migration.name.clone(),
                direction: migration.direction,
                source: err,
            })?;
        }

        let start = Instant::now();
        tracing::info!(
            name = %migration.name,
            direction = %migration.direction,
            dry_run = self.dry_run,
            "migrating"
        );

        if !self.dry_run {
            self.driver.apply(migration, save_version)?;
        }

        tracing::info!(
            name = %migration.name,
            direction = %migration.direction,
            elapsed_secs = format_args!("{:.4}", start.elapsed().as_secs_f64()),
            "migrated"
        );
        Ok(())
    }

    fn run_steps<'a>(
        &mut self,
        migrations: impl Iterator<Item = &'a Migration>,
    ) -> MigrationReport {
        let mut report = MigrationReport::default();
        for migration in migrations {
            match self.apply_one(migration, true) {
                Ok(()) => report.applied.push(migration.name.clone()),
                Err(error) => {
                    tracing::warn!(name = %migration.name, error = %error, "migration failed");
                    report.failure = Some(MigrationFailure {
                        name: migration.name.clone(),
                        error,
                    });
                    break;
                }
            }
        }
        report
    }

    /// Releases the mutex and closes the driver, in that order. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        if let Some(mutex) = self.mutex.as_mut() {
            mutex.unlock()?;
        }
        self.mutex = None;
        self.driver.close()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Migrator {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close migration engine");
            }
        }
    }
}

/// Reverses the roles of a plan's forward and compensating migrations, so a
/// previously generated plan can be replayed in the opposite direction. The
/// new forward list is re-sorted into the correct apply order for its
/// direction before the swap.
pub fn swap_plan_direction(plan: &mut Plan) {
    sort_migrations(&mut plan.revert_migrations);
    if plan.revert_migrations.first().map(|m| m.direction) == Some(Direction::Down) {
        reverse_sort_migrations(&mut plan.revert_migrations);
    }
    std::mem::swap(&mut plan.migrations, &mut plan.revert_migrations);
}

/// Lexicographic `raw_name` order: the canonical apply order for both
/// zero-padded sequence numbers and unix timestamps.
fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| a.raw_name.cmp(&b.raw_name));
}

fn reverse_sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| b.version.cmp(&a.version));
}

fn resolve_steps(limit: i64, available: usize) -> Result<usize, Error> {
    if limit < 0 {
        return Ok(available);
    }
    let requested = limit as usize;
    if available < requested {
        return Err(Error::NotEnoughMigrations {
            available,
            requested,
        });
    }
    Ok(requested)
}

fn compute_pending_migrations(
    applied: &[Migration],
    source: &[Migration],
) -> Result<Vec<Migration>, Error> {
    let available = source
        .iter()
        .filter(|m| m.direction == Direction::Up)
        .count();
    if applied.len() > available {
        return Err(Error::SourceBehind {
            applied: applied.len(),
            available,
        });
    }

    let applied_names: HashSet<&str> = applied.iter().map(|m| m.name.as_str()).collect();
    Ok(source
        .iter()
        .filter(|m| !applied_names.contains(m.name.as_str()))
        .cloned()
        .collect())
}

fn find_down_scripts(
    applied: &[Migration],
    source: Vec<Migration>,
) -> Result<HashMap<String, Migration>, Error> {
    let mut down_scripts = HashMap::new();
    for migration in source {
        if migration.direction != Direction::Down {
            continue;
        }
        down_scripts.insert(migration.name.clone(), migration);
    }

    for migration in applied {
        if !down_scripts.contains_key(&migration.name) {
            return Err(Error::MissingDownScript(migration.name.clone()));
        }
    }

    Ok(down_scripts)
}
