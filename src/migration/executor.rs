//! Migration executor - runs one migration through its state machine
//!
//! ```text
//! (no record) --start--> RUNNING --success--> SUCCESS
//!                              \--fault-----> FAILED
//! ```
//!
//! The `RUNNING` record is written before anything executes, so a crash in the
//! middle of a migration leaves visible evidence behind.

use crate::config::MigrationConfig;
use crate::migration::cql::split_statements;
use crate::migration::error::ProcedureError;
use crate::migration::file::{MigrationDefinition, MigrationKind};
use crate::migration::procedure::{Procedure, ProcedureLoader, ProcedureParams};
use crate::migration::record::{MigrationRecord, MigrationState};
use crate::migration::state_table;
use crate::migration::store::StateStore;
use crate::migration::MigrationError;
use crate::session::{Consistency, Session, Statement};
#[cfg(feature = "tracing")]
use crate::tracing_helpers;
use chrono::Utc;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executable form of a migration, resolved before anything runs
#[derive(Clone)]
pub enum MigrationBody {
    /// Individual statements of a `.cql` script
    Statements(Vec<String>),
    /// Entry point of a procedural migration
    Procedure(Arc<dyn Procedure>),
}

impl fmt::Debug for MigrationBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationBody::Statements(statements) => {
                f.debug_tuple("Statements").field(&statements.len()).finish()
            }
            MigrationBody::Procedure(_) => f.write_str("Procedure"),
        }
    }
}

/// Result of applying one migration
///
/// A failed migration is not an `Err`: its `FAILED` record has been written
/// and the caller decides to stop the run.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Applied { execution_time_ms: i64 },
    /// Always a `MigrationError::ExecutionFault`
    Failed(MigrationError),
}

impl ExecutionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ExecutionOutcome::Applied { .. })
    }
}

/// Applies migrations one at a time, recording each state transition
pub struct MigrationExecutor<'a> {
    session: &'a dyn Session,
    store: &'a dyn StateStore,
    loader: &'a dyn ProcedureLoader,
    params: &'a ProcedureParams,
    keyspace: &'a str,
    consistency: Consistency,
    timeout: Duration,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(
        session: &'a dyn Session,
        store: &'a dyn StateStore,
        loader: &'a dyn ProcedureLoader,
        config: &'a MigrationConfig,
    ) -> Self {
        Self {
            session,
            store,
            loader,
            params: &config.procedure_params,
            keyspace: &config.keyspace,
            consistency: config.consistency,
            timeout: config.request_timeout(),
        }
    }

    fn statement(&self, cql: impl Into<String>) -> Statement {
        Statement::new(cql)
            .with_consistency(self.consistency)
            .with_timeout(self.timeout)
    }

    /// Make the target keyspace the session default, so scripts need not
    /// qualify table names
    ///
    /// # Errors
    ///
    /// Returns `Connectivity` or `Database` if the statement fails.
    pub fn use_keyspace(&self) -> Result<(), MigrationError> {
        self.session
            .execute(&self.statement(state_table::use_keyspace(self.keyspace)))?;
        Ok(())
    }

    /// Resolve the executable body of a migration without running it
    ///
    /// # Errors
    ///
    /// Returns `UnknownProcedure` if a procedural migration has no registered entry point.
    pub fn prepare(&self, definition: &MigrationDefinition) -> Result<MigrationBody, MigrationError> {
        match definition.kind {
            MigrationKind::Statement => Ok(MigrationBody::Statements(split_statements(
                &definition.content,
            ))),
            MigrationKind::Procedural => Ok(MigrationBody::Procedure(self.loader.load(definition)?)),
        }
    }

    /// Apply a single migration
    ///
    /// # Errors
    ///
    /// Returns `Err` only when a state transition cannot be recorded. A fault
    /// in the migration itself is reported as [`ExecutionOutcome::Failed`].
    pub fn apply(
        &self,
        definition: &MigrationDefinition,
        body: &MigrationBody,
    ) -> Result<ExecutionOutcome, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(
            definition.version,
            &definition.description,
            definition.kind.as_str(),
        )
        .entered();

        log::info!("Applying migration {definition}");
        self.store.upsert_record(&MigrationRecord::for_definition(
            definition,
            MigrationState::Running,
            Utc::now(),
        ))?;

        let start = Instant::now();
        let result = match body {
            MigrationBody::Statements(statements) => self.run_statements(statements),
            MigrationBody::Procedure(procedure) => self
                .run_procedure(procedure.as_ref())
                .map_err(|source| (None, source)),
        };
        let execution_time_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(()) => {
                self.store.upsert_record(
                    &MigrationRecord::for_definition(definition, MigrationState::Success, Utc::now())
                        .with_execution_time(execution_time_ms),
                )?;
                log::info!(
                    "Applied migration {} in {execution_time_ms}ms",
                    definition.version
                );
                Ok(ExecutionOutcome::Applied { execution_time_ms })
            }
            Err((statement, source)) => {
                let fault = MigrationError::ExecutionFault {
                    version: definition.version,
                    description: definition.description.clone(),
                    statement,
                    source,
                };
                log::error!("{fault}");

                self.store.upsert_record(
                    &MigrationRecord::for_definition(definition, MigrationState::Failed, Utc::now())
                        .with_execution_time(execution_time_ms),
                )?;
                Ok(ExecutionOutcome::Failed(fault))
            }
        }
    }

    /// Run a procedure, turning a panic into an ordinary fault
    fn run_procedure(&self, procedure: &dyn Procedure) -> Result<(), ProcedureError> {
        panic::catch_unwind(AssertUnwindSafe(|| procedure.execute(self.session, self.params)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Err(format!("procedure panicked: {message}").into())
            })
    }

    /// Run statements in order, stopping at the first failure
    fn run_statements(&self, statements: &[String]) -> Result<(), (Option<usize>, ProcedureError)> {
        for (index, cql) in statements.iter().enumerate() {
            log::debug!("Executing statement {}/{}: {cql}", index + 1, statements.len());
            self.session
                .execute(&self.statement(cql.as_str()))
                .map_err(|e| (Some(index), Box::new(e) as ProcedureError))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::file::MigrationIdentity;
    use crate::migration::procedure::ProcedureRegistry;
    use crate::session::SessionError;
    use crate::test_helpers::{MemoryStateStore, RecordingSession};
    use std::path::PathBuf;

    fn definition(version: i64, kind: MigrationKind, content: &str) -> MigrationDefinition {
        MigrationDefinition::new(
            MigrationIdentity {
                version,
                description: "create_users".to_string(),
                kind,
            },
            PathBuf::from(format!("v{version:03}_create_users.{}", kind.extension())),
            content.to_string(),
        )
    }

    #[test]
    fn test_statements_run_in_order_and_record_success() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let registry = ProcedureRegistry::new();
        let config = MigrationConfig::new("app");
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(
            1,
            MigrationKind::Statement,
            "CREATE TABLE users (id uuid PRIMARY KEY);\n-- index\nCREATE INDEX ON users (id);",
        );
        let body = executor.prepare(&migration).unwrap();
        let outcome = executor.apply(&migration, &body).unwrap();

        assert!(outcome.is_applied());
        assert_eq!(
            session.executed_cql(),
            vec![
                "CREATE TABLE users (id uuid PRIMARY KEY)".to_string(),
                "CREATE INDEX ON users (id)".to_string(),
            ]
        );
        assert!(session
            .executed()
            .iter()
            .all(|s| s.consistency == Consistency::All && s.timeout.is_some()));

        let record = &store.records()[&1];
        assert_eq!(record.state, MigrationState::Success);
        assert_eq!(record.checksum, migration.checksum);
        assert!(record.execution_time_ms.is_some());
        // RUNNING, then SUCCESS
        assert_eq!(
            store.history(1),
            vec![MigrationState::Running, MigrationState::Success]
        );
    }

    #[test]
    fn test_failing_statement_aborts_the_rest() {
        let session = RecordingSession::new();
        session.fail("BROKEN", SessionError::query("line 1:0 no viable alternative"));
        let store = MemoryStateStore::new();
        let registry = ProcedureRegistry::new();
        let config = MigrationConfig::new("app");
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(
            2,
            MigrationKind::Statement,
            "CREATE TABLE a (id int PRIMARY KEY); BROKEN STATEMENT; CREATE TABLE b (id int PRIMARY KEY);",
        );
        let body = executor.prepare(&migration).unwrap();

        match executor.apply(&migration, &body).unwrap() {
            ExecutionOutcome::Failed(MigrationError::ExecutionFault { version, statement, .. }) => {
                assert_eq!(version, 2);
                assert_eq!(statement, Some(1));
            }
            other => panic!("expected a failed outcome, got {other:?}"),
        }
        assert_eq!(session.executed().len(), 2);
        assert_eq!(store.records()[&2].state, MigrationState::Failed);
    }

    #[test]
    fn test_procedure_receives_session_and_params() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let mut registry = ProcedureRegistry::new();
        registry
            .register(3, |session: &dyn Session, params: &ProcedureParams| -> Result<(), ProcedureError> {
                let table = params
                    .get("table")
                    .and_then(|v| v.as_str())
                    .ok_or("missing table parameter")?;
                session.execute(&Statement::new(format!("TRUNCATE {table}")))?;
                Ok(())
            })
            .unwrap();
        let mut config = MigrationConfig::new("app");
        config
            .procedure_params
            .insert("table".to_string(), serde_json::json!("sessions"));
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(3, MigrationKind::Procedural, "// truncate sessions");
        let body = executor.prepare(&migration).unwrap();
        assert!(executor.apply(&migration, &body).unwrap().is_applied());
        assert_eq!(session.executed_cql(), vec!["TRUNCATE sessions".to_string()]);
    }

    #[test]
    fn test_procedure_fault_is_recorded() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let mut registry = ProcedureRegistry::new();
        registry
            .register(4, |_: &dyn Session, _: &ProcedureParams| -> Result<(), ProcedureError> {
                Err("backfill source is empty".into())
            })
            .unwrap();
        let config = MigrationConfig::new("app");
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(4, MigrationKind::Procedural, "// backfill");
        let body = executor.prepare(&migration).unwrap();
        let outcome = executor.apply(&migration, &body).unwrap();

        match outcome {
            ExecutionOutcome::Failed(err) => {
                assert!(err.to_string().contains("backfill source is empty"));
                assert!(std::error::Error::source(&err).is_some());
            }
            ExecutionOutcome::Applied { .. } => panic!("procedure fault must fail the migration"),
        }
        assert_eq!(store.records()[&4].state, MigrationState::Failed);
    }

    #[test]
    fn test_procedure_panic_is_recorded_as_failure() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let mut registry = ProcedureRegistry::new();
        registry
            .register(6, |_: &dyn Session, _: &ProcedureParams| -> Result<(), ProcedureError> {
                let rows: Vec<i64> = Vec::new();
                Err(format!("row {}", rows[3]).into())
            })
            .unwrap();
        let config = MigrationConfig::new("app");
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(6, MigrationKind::Procedural, "// index out of bounds");
        let body = executor.prepare(&migration).unwrap();

        match executor.apply(&migration, &body).unwrap() {
            ExecutionOutcome::Failed(err) => {
                assert!(matches!(err, MigrationError::ExecutionFault { version: 6, statement: None, .. }));
                assert!(err.to_string().contains("panicked"), "{err}");
            }
            ExecutionOutcome::Applied { .. } => panic!("a panicking procedure must fail the migration"),
        }
        assert_eq!(
            store.history(6),
            vec![MigrationState::Running, MigrationState::Failed]
        );
    }

    #[test]
    fn test_unregistered_procedure_fails_before_running() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let registry = ProcedureRegistry::new();
        let config = MigrationConfig::new("app");
        let executor = MigrationExecutor::new(&session, &store, &registry, &config);

        let migration = definition(5, MigrationKind::Procedural, "// nothing registered");
        assert!(matches!(
            executor.prepare(&migration),
            Err(MigrationError::UnknownProcedure { version: 5, .. })
        ));
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_use_keyspace() {
        let session = RecordingSession::new();
        let store = MemoryStateStore::new();
        let registry = ProcedureRegistry::new();
        let config = MigrationConfig::new("app");
        MigrationExecutor::new(&session, &store, &registry, &config)
            .use_keyspace()
            .unwrap();
        assert_eq!(session.executed_cql(), vec!["USE \"app\"".to_string()]);
    }
}
