//! Migration-specific error types

use crate::migration::record::MigrationState;
use crate::session::SessionError;
use std::path::PathBuf;
use thiserror::Error;

/// Fault raised by a migration's own statements or procedure
pub type ProcedureError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Migration-specific errors
///
/// Catalog and planning errors are raised before anything is written.
/// `ExecutionFault` is only raised after the failure has been recorded.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration file name does not match `<version>_<description>.<ext>`
    #[error("Malformed migration file name '{name}': {reason}")]
    MalformedName { name: String, reason: String },

    /// Two migration files share a version
    #[error("Duplicate migration version {version}: {} and {}", .first.display(), .second.display())]
    DuplicateVersion {
        version: i64,
        first: PathBuf,
        second: PathBuf,
    },

    /// The catalog skips versions while gaps are rejected
    #[error("Migration versions must be contiguous: found {found} after {previous}, expected {}", .previous + 1)]
    Sequence { previous: i64, found: i64 },

    /// A successfully applied migration has been edited since
    #[error(
        "Migration '{description}' (version {version}) has been modified after being applied.\n\
         Stored checksum: {stored}\n\
         Current checksum: {current}\n\
         This indicates the migration file was edited after deployment."
    )]
    ChecksumMismatch {
        version: i64,
        description: String,
        stored: String,
        current: String,
    },

    /// A previous run left a `RUNNING` or `FAILED` record behind
    #[error(
        "Migration '{description}' (version {version}) is in state {state}, cannot continue.\n\
         Inspect the schema, then re-run with force to retry from this version."
    )]
    PriorFailure {
        version: i64,
        description: String,
        state: MigrationState,
    },

    /// The migration lock is held by another instance
    #[error(
        "Migration lock is held by '{holder}' since {acquired_at}.\n\
         Another process may be running migrations. If that process died, \
         inspect the schema and re-run with force to clear the lock."
    )]
    LockContention { holder: String, acquired_at: String },

    /// The lock this instance held was taken over or has vanished
    #[error("Migration lock is no longer held by '{expected}' (current holder: {})", .actual.as_deref().unwrap_or("none"))]
    LockOwnership {
        expected: String,
        actual: Option<String>,
    },

    /// Transport failure or timeout talking to the cluster
    #[error("Connectivity error: {0}")]
    Connectivity(#[source] SessionError),

    /// The cluster rejected a state-store statement
    #[error("Database error: {0}")]
    Database(#[source] SessionError),

    /// A migration's own statement or procedure failed; recorded as `FAILED`
    #[error("Migration '{description}' (version {version}) failed during execution{}: {source}", .statement.map(|i| format!(" at statement {}", i + 1)).unwrap_or_default())]
    ExecutionFault {
        version: i64,
        description: String,
        /// Zero-based index of the failing statement, for statement scripts
        statement: Option<usize>,
        #[source]
        source: ProcedureError,
    },

    /// The state table holds a version that has no migration file
    #[error(
        "Found version in database without corresponding migration (version {version}): {description}\n\
         Suggestion: Ensure all migration files are present in migrations directory"
    )]
    UnknownMigration { version: i64, description: String },

    /// A catalog version below the applied frontier was never recorded
    #[error("Migration version {version} has no record although version {applied} was applied after it")]
    InconsistentHistory { version: i64, applied: i64 },

    /// The requested target does not name a catalog migration
    #[error("Invalid target version '{0}': must be a number > 0 or the description of an existing migration")]
    InvalidTarget(String),

    /// No procedure is registered for a procedural migration
    #[error("No procedure registered for migration '{description}' (version {version})")]
    UnknownProcedure { version: i64, description: String },

    /// A procedure was registered twice for the same version
    #[error("A procedure is already registered for version {0}")]
    AlreadyRegistered(i64),

    /// Filesystem failure while reading or writing migration files
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MigrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<SessionError> for MigrationError {
    fn from(error: SessionError) -> Self {
        if error.kind.is_transport() {
            MigrationError::Connectivity(error)
        } else {
            MigrationError::Database(error)
        }
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}
