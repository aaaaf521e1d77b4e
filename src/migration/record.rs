//! `MigrationRecord` and `LockRecord` - rows of the state and lock tables

use crate::migration::file::{MigrationDefinition, MigrationKind};
use crate::session::{Row, SessionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Execution state of a migration record
///
/// ```text
/// (no record) --start--> RUNNING --success--> SUCCESS
///                              \--fault-----> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Running,
    Success,
    Failed,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Running => "RUNNING",
            MigrationState::Success => "SUCCESS",
            MigrationState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(MigrationState::Running),
            "SUCCESS" => Ok(MigrationState::Success),
            "FAILED" => Ok(MigrationState::Failed),
            other => Err(format!("unknown migration state '{other}'")),
        }
    }
}

/// Represents a row of the migration state table
///
/// One row per applied or attempted version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,

    pub description: String,

    /// `SHA-256` checksum of the migration content at application time
    pub checksum: String,

    pub kind: MigrationKind,

    pub state: MigrationState,

    /// Time of the last state transition
    pub applied_at: DateTime<Utc>,

    /// Execution time in milliseconds (`None` while running or when baselined)
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    /// Record mirroring `definition` in the given state
    #[must_use]
    pub fn for_definition(
        definition: &MigrationDefinition,
        state: MigrationState,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: definition.version,
            description: definition.description.clone(),
            checksum: definition.checksum.clone(),
            kind: definition.kind,
            state,
            applied_at,
            execution_time_ms: None,
        }
    }

    #[must_use]
    pub fn with_execution_time(mut self, execution_time_ms: i64) -> Self {
        self.execution_time_ms = Some(execution_time_ms);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == MigrationState::Success
    }

    /// Create a `MigrationRecord` from a state table row
    ///
    /// Expected columns: `version`, `description`, `checksum`, `kind`, `state`,
    /// `applied_at`, `execution_time_ms`
    ///
    /// # Errors
    ///
    /// Returns a decode `SessionError` if a column is missing or holds an
    /// unknown kind/state.
    pub fn from_row(row: &Row) -> Result<Self, SessionError> {
        let kind = row
            .get_text("kind")?
            .parse::<MigrationKind>()
            .map_err(SessionError::decode)?;
        let state = row
            .get_text("state")?
            .parse::<MigrationState>()
            .map_err(SessionError::decode)?;

        Ok(Self {
            version: row.get_i64("version")?,
            description: row.get_text("description")?,
            checksum: row.get_text("checksum")?,
            kind,
            state,
            applied_at: row.get_timestamp("applied_at")?,
            execution_time_ms: row.get_opt_i64("execution_time_ms")?,
        })
    }
}

/// The singleton lock row; its existence is the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    /// Identifier of the acquiring instance
    pub holder: String,

    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// # Errors
    ///
    /// Returns a decode `SessionError` if `holder` or `acquired_at` is missing.
    pub fn from_row(row: &Row) -> Result<Self, SessionError> {
        Ok(Self {
            holder: row.get_text("holder")?,
            acquired_at: row.get_timestamp("acquired_at")?,
        })
    }

    /// How long the lock has been held, as of `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.acquired_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Value;

    fn state_row(state: &str) -> Row {
        Row::new()
            .with("version", 7i64)
            .with("description", "add_users")
            .with("checksum", "deadbeef")
            .with("kind", "STATEMENT")
            .with("state", state)
            .with("applied_at", Utc::now())
            .with("execution_time_ms", Value::Null)
    }

    #[test]
    fn test_record_from_row() {
        let record = MigrationRecord::from_row(&state_row("FAILED")).unwrap();
        assert_eq!(record.version, 7);
        assert_eq!(record.kind, MigrationKind::Statement);
        assert_eq!(record.state, MigrationState::Failed);
        assert_eq!(record.execution_time_ms, None);
        assert!(!record.is_success());
    }

    #[test]
    fn test_record_from_row_rejects_unknown_state() {
        assert!(MigrationRecord::from_row(&state_row("SKIPPED")).is_err());
    }

    #[test]
    fn test_lock_record_age() {
        let acquired_at = Utc::now() - chrono::Duration::minutes(5);
        let row = Row::new().with("holder", "db-1:4242:1f2e").with("acquired_at", acquired_at);
        let lock = LockRecord::from_row(&row).unwrap();
        assert_eq!(lock.holder, "db-1:4242:1f2e");
        assert!(lock.age(Utc::now()) >= chrono::Duration::minutes(5));
    }
}
