//! Test doubles for exercising the engine without a real database.
//!
//! The scripted driver mimics what a concrete driver would do to the applied
//! set, and can be told to fail at a specific version so failure handling and
//! plan compensation are observable. Every `apply` call is recorded,
//! including whether the version row would have been saved.

use std::sync::{Arc, Mutex};

use crate::drivers::{ConfigValue, Driver};
use crate::error::Error;
use crate::models::{Direction, Migration};
use crate::sources::{MemorySource, Source};

/// One recorded [`Driver::apply`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCall {
    pub name: String,
    pub direction: Direction,
    pub save_version: bool,
}

#[derive(Default)]
struct ScriptedState {
    applied: Vec<Migration>,
    calls: Vec<AppliedCall>,
}

/// An in-memory driver that fails on request.
///
/// `fail_at`/`fail_direction` select the migration whose apply errors; a
/// `fail_at` of zero never fails.
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptedState>>,
    pub fail_at: u32,
    pub fail_direction: Direction,
}

impl ScriptedDriver {
    pub fn new() -> ScriptedDriver {
        ScriptedDriver {
            state: Arc::new(Mutex::new(ScriptedState::default())),
            fail_at: 0,
            fail_direction: Direction::Up,
        }
    }

    pub fn failing_at(version: u32, direction: Direction) -> ScriptedDriver {
        let mut driver = ScriptedDriver::new();
        driver.fail_at = version;
        driver.fail_direction = direction;
        driver
    }

    /// Seeds the applied set, as if earlier runs had recorded these rows.
    pub fn with_applied(self, applied: Vec<Migration>) -> ScriptedDriver {
        self.state.lock().unwrap().applied = applied;
        self
    }

    /// A handle that observes this driver's state after the driver itself
    /// has been moved into an engine.
    pub fn observer(&self) -> ScriptedObserver {
        ScriptedObserver {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for ScriptedDriver {
    fn default() -> ScriptedDriver {
        ScriptedDriver::new()
    }
}

pub struct ScriptedObserver {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedObserver {
    pub fn applied_versions(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|m| m.version)
            .collect()
    }

    pub fn calls(&self) -> Vec<AppliedCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn ping(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn applied_migrations(&mut self) -> Result<Vec<Migration>, Error> {
        let mut applied = self.state.lock().unwrap().applied.clone();
        applied.sort_by_key(|m| m.version);
        Ok(applied)
    }

    fn apply(&mut self, migration: &Migration, save_version: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(AppliedCall {
            name: migration.name.clone(),
            direction: migration.direction,
            save_version,
        });

        if migration.version == self.fail_at && migration.direction == self.fail_direction {
            return Err(Error::ApplyFailed {
                name: migration.name.clone(),
                query: String::new(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "scripted failure",
                )),
            });
        }

        if !save_version {
            return Ok(());
        }

        match migration.direction {
            Direction::Down => {
                state.applied.retain(|m| m.name != migration.name);
            }
            Direction::Up => {
                state.applied.push(Migration {
                    bytes: Vec::new(),
                    ..migration.clone()
                });
            }
        }
        Ok(())
    }

    fn set_config(&mut self, _key: &str, _value: ConfigValue) -> Result<(), Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// A source holding `count` up/down pairs named `migration_<letter>`, with
/// bodies that are valid SQL against any backend.
pub fn basic_source(count: usize) -> MemorySource {
    let mut migrations = Vec::new();
    for i in 0..count {
        let letter = (b'a' + i as u8) as char;
        let version = i + 1;
        migrations.push(
            Migration::from_file(
                &format!("{version:06}_migration_{letter}.up.sql"),
                format!("CREATE TABLE table_{letter} (id integer);").into_bytes(),
            )
            .unwrap(),
        );
        migrations.push(
            Migration::from_file(
                &format!("{version:06}_migration_{letter}.down.sql"),
                format!("DROP TABLE table_{letter};").into_bytes(),
            )
            .unwrap(),
        );
    }
    MemorySource::new(migrations)
}

/// The up migrations of [`basic_source`], in apply order.
pub fn basic_up_migrations(count: usize) -> Vec<Migration> {
    basic_source(count)
        .migrations()
        .into_iter()
        .filter(|m| m.direction == Direction::Up)
        .collect()
}
