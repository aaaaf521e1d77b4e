//! Schema state store - durable migration records and the migration lock
//!
//! All coordination between independently started instances goes through the
//! store. The lock is a single row written with a lightweight transaction
//! (`IF NOT EXISTS`), so two instances can never both acquire it.

use crate::config::{KeyspaceProfile, MigrationConfig};
use crate::migration::lock::LockHolder;
use crate::migration::record::{LockRecord, MigrationRecord};
use crate::migration::state_table::{self, LOCK_ID};
use crate::migration::MigrationError;
use crate::session::{Consistency, ResultSet, Session, Statement, Value};
#[cfg(feature = "tracing")]
use crate::tracing_helpers;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

/// Durable migration and lock state
///
/// Implementations must make `try_acquire_lock` and `release_lock` linearizable.
pub trait StateStore {
    /// Create the keyspace and state tables if they are missing
    ///
    /// Safe to call from several instances at once.
    fn ensure_schema(&self, profile: &KeyspaceProfile) -> Result<(), MigrationError>;

    /// Whether the keyspace and state tables exist
    fn schema_exists(&self) -> Result<bool, MigrationError>;

    /// Drop the keyspace, including all state
    fn drop_schema(&self) -> Result<(), MigrationError>;

    /// All migration records, keyed by version
    fn read_all_records(&self) -> Result<BTreeMap<i64, MigrationRecord>, MigrationError>;

    /// Unconditionally write a record; only called while holding the lock
    fn upsert_record(&self, record: &MigrationRecord) -> Result<(), MigrationError>;

    /// Current lock row, if any
    fn read_lock(&self) -> Result<Option<LockRecord>, MigrationError>;

    /// Insert the lock row if no row exists
    ///
    /// Returns `Ok(false)` if another holder has it; the caller decides
    /// whether that is fatal.
    fn try_acquire_lock(&self, holder: &LockHolder) -> Result<bool, MigrationError>;

    /// Delete the lock row if `holder` still owns it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockOwnership` if the row was taken over or vanished.
    fn release_lock(&self, holder: &LockHolder) -> Result<(), MigrationError>;

    /// Delete the lock row regardless of its holder
    fn force_clear_lock(&self) -> Result<(), MigrationError>;
}

/// `StateStore` backed by the cluster itself
///
/// Every statement runs at the configured consistency (default `ALL`), with
/// conditional statements using the configured serial consistency, and is
/// bounded by the configured request timeout.
pub struct CqlStateStore<'a> {
    session: &'a dyn Session,
    keyspace: String,
    table: String,
    lock_table: String,
    consistency: Consistency,
    serial_consistency: Consistency,
    timeout: Duration,
}

impl<'a> CqlStateStore<'a> {
    pub fn new(session: &'a dyn Session, config: &MigrationConfig) -> Self {
        Self {
            session,
            keyspace: config.keyspace.clone(),
            table: config.migrations_table.clone(),
            lock_table: config.lock_table(),
            consistency: config.consistency,
            serial_consistency: config.serial_consistency,
            timeout: config.request_timeout(),
        }
    }

    fn statement(&self, cql: impl Into<String>) -> Statement {
        Statement::new(cql)
            .with_consistency(self.consistency)
            .with_timeout(self.timeout)
    }

    fn conditional(&self, cql: impl Into<String>) -> Statement {
        self.statement(cql)
            .with_serial_consistency(self.serial_consistency)
    }

    fn run(&self, operation: &str, statement: &Statement) -> Result<ResultSet, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::store_operation_span(operation).entered();

        log::debug!("Executing {operation}: {}", statement.cql);
        Ok(self.session.execute(statement)?)
    }
}

impl StateStore for CqlStateStore<'_> {
    fn ensure_schema(&self, profile: &KeyspaceProfile) -> Result<(), MigrationError> {
        log::info!(
            "Ensuring keyspace '{}' and table '{}' exist",
            self.keyspace,
            self.table
        );

        self.run(
            "create_keyspace",
            &self.statement(state_table::create_keyspace(&self.keyspace, profile)),
        )?;
        self.run(
            "create_state_table",
            &self.statement(state_table::create_state_table(&self.keyspace, &self.table)),
        )?;
        self.run(
            "create_lock_table",
            &self.statement(state_table::create_lock_table(&self.keyspace, &self.lock_table)),
        )?;
        Ok(())
    }

    fn schema_exists(&self) -> Result<bool, MigrationError> {
        let result = self.run(
            "schema_exists",
            &self
                .statement(state_table::select_existing_tables())
                .bind(self.keyspace.as_str()),
        )?;

        let mut has_table = false;
        let mut has_lock_table = false;
        for row in &result.rows {
            let name = row.get_text("table_name")?;
            has_table |= name == self.table;
            has_lock_table |= name == self.lock_table;
        }
        Ok(has_table && has_lock_table)
    }

    fn drop_schema(&self) -> Result<(), MigrationError> {
        log::warn!("Dropping keyspace '{}'", self.keyspace);
        self.run(
            "drop_keyspace",
            &self.statement(state_table::drop_keyspace(&self.keyspace)),
        )?;
        Ok(())
    }

    fn read_all_records(&self) -> Result<BTreeMap<i64, MigrationRecord>, MigrationError> {
        let result = self.run(
            "read_records",
            &self.statement(state_table::select_records(&self.keyspace, &self.table)),
        )?;

        // Rows come back in token order, the map restores version order
        let mut records = BTreeMap::new();
        for row in &result.rows {
            let record = MigrationRecord::from_row(row)?;
            records.insert(record.version, record);
        }
        Ok(records)
    }

    fn upsert_record(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        log::debug!(
            "Recording version {} as {}",
            record.version,
            record.state
        );

        let statement = self
            .statement(state_table::upsert_record(&self.keyspace, &self.table))
            .bind(record.version)
            .bind(record.description.as_str())
            .bind(record.checksum.as_str())
            .bind(record.kind.as_str())
            .bind(record.state.as_str())
            .bind(record.applied_at)
            .bind(record.execution_time_ms);
        self.run("upsert_record", &statement)?;
        Ok(())
    }

    fn read_lock(&self) -> Result<Option<LockRecord>, MigrationError> {
        let result = self.run(
            "read_lock",
            &self
                .statement(state_table::select_lock(&self.keyspace, &self.lock_table))
                .bind(LOCK_ID),
        )?;

        match result.first() {
            Some(row) => Ok(Some(LockRecord::from_row(row)?)),
            None => Ok(None),
        }
    }

    fn try_acquire_lock(&self, holder: &LockHolder) -> Result<bool, MigrationError> {
        let statement = self
            .conditional(state_table::insert_lock(&self.keyspace, &self.lock_table))
            .bind(LOCK_ID)
            .bind(holder.as_str())
            .bind(Utc::now());

        let applied = self.run("acquire_lock", &statement)?.applied()?;
        if applied {
            log::info!("Acquired migration lock as '{holder}'");
        } else {
            log::debug!("Migration lock is already held, '{holder}' did not acquire it");
        }
        Ok(applied)
    }

    fn release_lock(&self, holder: &LockHolder) -> Result<(), MigrationError> {
        let statement = self
            .conditional(state_table::delete_lock_if_holder(&self.keyspace, &self.lock_table))
            .bind(LOCK_ID)
            .bind(holder.as_str());

        let result = self.run("release_lock", &statement)?;
        if result.applied()? {
            log::info!("Released migration lock held by '{holder}'");
            return Ok(());
        }

        // A rejected conditional delete returns the current holder, if there is one
        let actual = match result.first().and_then(|row| row.get("holder")) {
            Some(Value::Text(current)) => Some(current.clone()),
            _ => None,
        };
        log::error!(
            "Migration lock changed owner while held by '{holder}' (current holder: {})",
            actual.as_deref().unwrap_or("none")
        );
        Err(MigrationError::LockOwnership {
            expected: holder.to_string(),
            actual,
        })
    }

    fn force_clear_lock(&self) -> Result<(), MigrationError> {
        log::warn!("Force-clearing migration lock in keyspace '{}'", self.keyspace);
        self.run(
            "force_clear_lock",
            &self
                .statement(state_table::delete_lock(&self.keyspace, &self.lock_table))
                .bind(LOCK_ID),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::file::MigrationKind;
    use crate::migration::record::MigrationState;
    use crate::session::{Row, SessionError, APPLIED_COLUMN};
    use crate::test_helpers::RecordingSession;

    fn store(session: &RecordingSession) -> CqlStateStore<'_> {
        CqlStateStore::new(session, &MigrationConfig::new("app"))
    }

    #[test]
    fn test_ensure_schema_statements() {
        let session = RecordingSession::new();
        store(&session).ensure_schema(&KeyspaceProfile::simple(1)).unwrap();

        let executed = session.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].cql.starts_with("CREATE KEYSPACE IF NOT EXISTS \"app\""));
        assert!(executed[1].cql.contains("\"app\".\"database_migrations\""));
        assert!(executed[2].cql.contains("\"app\".\"database_migrations_lock\""));
        assert!(executed
            .iter()
            .all(|s| s.consistency == Consistency::All && s.timeout == Some(Duration::from_secs(120))));
    }

    #[test]
    fn test_schema_exists_needs_both_tables() {
        let session = RecordingSession::new();
        session.respond(
            "system_schema.tables",
            ResultSet::from_rows(vec![Row::new().with("table_name", "database_migrations")]),
        );
        assert!(!store(&session).schema_exists().unwrap());

        let session = RecordingSession::new();
        session.respond(
            "system_schema.tables",
            ResultSet::from_rows(vec![
                Row::new().with("table_name", "database_migrations"),
                Row::new().with("table_name", "database_migrations_lock"),
            ]),
        );
        assert!(store(&session).schema_exists().unwrap());
    }

    #[test]
    fn test_read_all_records_orders_by_version() {
        let session = RecordingSession::new();
        let row = |version: i64, state: &str| {
            Row::new()
                .with("version", version)
                .with("description", format!("m{version}"))
                .with("checksum", "abc")
                .with("kind", "STATEMENT")
                .with("state", state)
                .with("applied_at", Utc::now())
                .with("execution_time_ms", 12i64)
        };
        session.respond(
            "SELECT version",
            ResultSet::from_rows(vec![row(3, "FAILED"), row(1, "SUCCESS"), row(2, "SUCCESS")]),
        );

        let records = store(&session).read_all_records().unwrap();
        assert_eq!(records.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(records[&3].state, MigrationState::Failed);
        assert_eq!(records[&1].execution_time_ms, Some(12));
    }

    #[test]
    fn test_upsert_binds_all_columns() {
        let session = RecordingSession::new();
        let record = MigrationRecord {
            version: 4,
            description: "add_index".to_string(),
            checksum: "ff".to_string(),
            kind: MigrationKind::Statement,
            state: MigrationState::Running,
            applied_at: Utc::now(),
            execution_time_ms: None,
        };
        store(&session).upsert_record(&record).unwrap();

        let executed = session.executed();
        assert_eq!(executed[0].values.len(), 7);
        assert_eq!(executed[0].values[0], Value::BigInt(4));
        assert_eq!(executed[0].values[4], Value::Text("RUNNING".to_string()));
        assert_eq!(executed[0].values[6], Value::Null);
        assert!(executed[0].serial_consistency.is_none());
    }

    #[test]
    fn test_try_acquire_lock_uses_lightweight_transaction() {
        let session = RecordingSession::new();
        session.respond(
            "IF NOT EXISTS",
            ResultSet::from_rows(vec![Row::new().with(APPLIED_COLUMN, false).with("holder", "other")]),
        );
        let holder = LockHolder::new("host-a");

        assert!(!store(&session).try_acquire_lock(&holder).unwrap());
        let executed = session.executed();
        assert_eq!(executed[0].serial_consistency, Some(Consistency::Serial));
        assert_eq!(executed[0].values[1], Value::Text(holder.to_string()));
    }

    #[test]
    fn test_release_lock_reports_new_owner() {
        let session = RecordingSession::new();
        session.respond(
            "IF holder = ?",
            ResultSet::from_rows(vec![Row::new().with(APPLIED_COLUMN, false).with("holder", "host-b")]),
        );
        let holder = LockHolder::new("host-a");

        match store(&session).release_lock(&holder) {
            Err(MigrationError::LockOwnership { expected, actual }) => {
                assert_eq!(expected, holder.to_string());
                assert_eq!(actual.as_deref(), Some("host-b"));
            }
            other => panic!("expected LockOwnership, got {other:?}"),
        }
    }

    #[test]
    fn test_release_lock_vanished() {
        let session = RecordingSession::new();
        session.respond(
            "IF holder = ?",
            ResultSet::from_rows(vec![Row::new().with(APPLIED_COLUMN, false)]),
        );

        let err = store(&session).release_lock(&LockHolder::new("host-a")).unwrap_err();
        assert!(matches!(err, MigrationError::LockOwnership { actual: None, .. }));
    }

    #[test]
    fn test_timeout_surfaces_as_connectivity_error() {
        let session = RecordingSession::new();
        session.fail("SELECT holder", SessionError::timeout("no response within 120s"));

        let err = store(&session).read_lock().unwrap_err();
        assert!(matches!(err, MigrationError::Connectivity(_)));
    }
}
