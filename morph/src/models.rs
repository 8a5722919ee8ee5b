//! Core data entities: [`Migration`], [`Direction`] and [`Plan`].
//!
//! Migrations are immutable once constructed by a source. Plans are produced
//! by the engine, serialized to JSON by operators, and consumed unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The direction a migration runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Direction::Up => ".up.",
            Direction::Down => ".down.",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// A single schema change script.
///
/// `name` and `version` together form the match key that pairs a forward
/// migration with its compensating partner. `raw_name` keeps the original
/// filename because its lexicographic order is the canonical apply order for
/// both zero-padded sequence numbers and unix timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Migration {
    pub name: String,
    pub version: u32,
    pub raw_name: String,
    pub direction: Direction,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl Migration {
    /// Parses a migration out of a filename of the form
    /// `<version>_<name>.(up|down).<ext>` and the script body.
    ///
    /// The version prefix is either a zero-padded sequence number or a unix
    /// timestamp; both parse as plain integers. The stored `name` is the
    /// middle segment with the version prefix and the direction/extension
    /// suffix stripped.
    pub fn from_file(raw_name: &str, bytes: Vec<u8>) -> Result<Migration, Error> {
        let invalid = || {
            Error::app(
                "source",
                format!(
                    "invalid migration filename {raw_name:?}, expected <version>_<name>.(up|down).<ext>"
                ),
            )
        };

        let Some((prefix, rest)) = raw_name.split_once('_') else {
            return Err(invalid());
        };
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let version: u32 = prefix.parse().map_err(|_| invalid())?;

        // The name may itself contain dots, so the direction marker is the
        // last `.up.` or `.down.` occurrence before the extension.
        let up_at = rest.rfind(Direction::Up.suffix());
        let down_at = rest.rfind(Direction::Down.suffix());
        let (direction, at, marker) = match (up_at, down_at) {
            (Some(u), Some(d)) if u > d => (Direction::Up, u, Direction::Up.suffix()),
            (Some(u), None) => (Direction::Up, u, Direction::Up.suffix()),
            (_, Some(d)) => (Direction::Down, d, Direction::Down.suffix()),
            (None, None) => return Err(invalid()),
        };

        let name = &rest[..at];
        let ext = &rest[at + marker.len()..];
        if name.is_empty() || ext.is_empty() {
            return Err(invalid());
        }

        Ok(Migration {
            name: name.to_string(),
            version,
            raw_name: raw_name.to_string(),
            direction,
            bytes,
        })
    }

    /// The script body as UTF-8 text.
    pub fn script(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.bytes).map_err(|err| {
            Error::app_with(
                "source",
                format!("migration {} is not valid utf-8", self.raw_name),
                err,
            )
        })
    }
}

pub const CURRENT_PLAN_VERSION: i32 = 1;

/// An explicit, persistable sequence of migrations with pre-matched
/// compensators. `revert_migrations` is paired one-to-one with `migrations`
/// by `(name, version)` and runs in the opposite direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan {
    /// Plan-schema version. Unknown versions are rejected on load so future
    /// shape changes can add a migration path.
    pub version: i32,
    /// If true, a failed apply triggers compensating migrations for the
    /// steps already taken, in reverse order.
    pub auto: bool,
    pub migrations: Vec<Migration>,
    pub revert_migrations: Vec<Migration>,
}

impl Plan {
    pub fn new(migrations: Vec<Migration>, revert_migrations: Vec<Migration>, auto: bool) -> Plan {
        Plan {
            version: CURRENT_PLAN_VERSION,
            auto,
            migrations,
            revert_migrations,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != CURRENT_PLAN_VERSION {
            return Err(Error::InvalidPlanVersion(self.version));
        }
        Ok(())
    }

    /// Parses a plan from its JSON representation, rejecting unknown plan
    /// versions.
    pub fn from_json(bytes: &[u8]) -> Result<Plan, Error> {
        let plan: Plan = serde_json::from_slice(bytes)
            .map_err(|err| Error::app_with("plan", "failed to parse plan file", err))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec_pretty(self)
            .map_err(|err| Error::app_with("plan", "failed to serialize plan", err))
    }
}
