use crate::models::Direction;

/// Error type for the morph crate.
///
/// Variants fall into two broad categories: application errors (bad
/// configuration, invalid plans, source/driver mismatches) where no database
/// state has changed, and database errors where a round-trip to the backing
/// store failed. [`Error::is_database`] distinguishes the two so callers can
/// tell "you asked for something impossible" apart from "the migration was
/// cancelled mid-flight".
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Mis-configuration or invalid input; the database was not touched.
    #[error("{driver}: {message}")]
    App {
        driver: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A driver round-trip failed. Carries the command that was being
    /// executed and, when available, the offending query text.
    #[error("{driver}: {message} (command: {command})")]
    Database {
        driver: &'static str,
        command: &'static str,
        message: String,
        query: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A migration body failed to execute. The driver has already rolled the
    /// transaction back (when one was open).
    #[error("failed to apply migration {name}")]
    ApplyFailed {
        name: String,
        query: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A compensating migration failed while unwinding a plan. The database
    /// is in an inconsistent state and needs operator attention.
    #[error("could not rollback migrations after trying to migrate")]
    RollbackFailed(#[source] Box<Error>),

    /// A plan step failed and compensation completed; wraps the original
    /// failure.
    #[error("could not apply migration")]
    PlanFailed(#[source] Box<Error>),

    /// More migrations are recorded as applied than the source knows about,
    /// which means the database was migrated by a newer binary.
    #[error(
        "migration mismatch, there are more migrations applied ({applied}) than those were specified in source ({available})"
    )]
    SourceBehind { applied: usize, available: usize },

    /// An applied migration has no down script in the source.
    #[error("could not find down script for {0}")]
    MissingDownScript(String),

    /// Migrations handed to plan generation do not share a direction.
    #[error("migrations have different directions")]
    MismatchedDirections,

    /// The source lacks an opposite-direction partner for a migration.
    #[error("not all migrations have opposite migrations")]
    NoOppositeFound,

    #[error("there are only {available} migrations available, but you requested {requested}")]
    NotEnoughMigrations { available: usize, requested: usize },

    #[error("invalid plan version {0}")]
    InvalidPlanVersion(i32),

    #[error("migration {name} is {size} bytes, which exceeds the maximum of {max} bytes")]
    MigrationTooLarge {
        name: String,
        size: usize,
        max: usize,
    },

    /// The driver has no live connection.
    #[error("{0}: database connection is missing")]
    NotConnected(&'static str),

    /// Lock acquisition was cancelled before the mutex could be obtained.
    #[error("mutex acquisition cancelled")]
    LockUnavailable,

    /// The mutex lease was stolen by a peer after expiring.
    #[error("mutex lease for {0} was lost")]
    LeaseLost(String),

    /// An interceptor aborted a migration before it started.
    #[error("interceptor aborted {direction} migration {name}")]
    Interceptor {
        name: String,
        direction: Direction,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub(crate) fn app(driver: &'static str, message: impl Into<String>) -> Self {
        Error::App {
            driver,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn app_with(
        driver: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::App {
            driver,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn database(
        driver: &'static str,
        command: &'static str,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Database {
            driver,
            command,
            message: message.into(),
            query: None,
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn with_query(mut self, q: impl Into<String>) -> Self {
        if let Error::Database { ref mut query, .. } = self {
            *query = Some(q.into());
        }
        self
    }

    /// Whether this error originated from a database round-trip, as opposed
    /// to an application-level mistake. Wrapper variants delegate to the
    /// error they carry.
    pub fn is_database(&self) -> bool {
        match self {
            Error::Database { .. }
            | Error::ApplyFailed { .. }
            | Error::LeaseLost(_) => true,
            Error::PlanFailed(inner) | Error::RollbackFailed(inner) => inner.is_database(),
            _ => false,
        }
    }
}
