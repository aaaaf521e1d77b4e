//! Schema migrations for Cassandra-compatible keyspaces
//!
//! This module provides the migration engine:
//! - Migration catalog discovered from a directory of `.cql` and `.rs` files
//! - State table and lock row kept in the target keyspace
//! - Planning against recorded state, with checksum drift detection
//! - Execution with per-migration state tracking
//!
//! Several instances may start at once; they coordinate only through the
//! lock row, written with a lightweight transaction.
//!
//! # Example
//!
//! ```rust,no_run
//! use harbormaster::config::MigrationConfig;
//! use harbormaster::migration::{MigrationError, Migrator};
//! use harbormaster::session::Session;
//!
//! fn deploy(session: &dyn Session) -> Result<(), MigrationError> {
//!     let mut config = MigrationConfig::new("app");
//!     config.migrations_path = "db/migrations".into();
//!
//!     let migrator = Migrator::new(config, "dev")?;
//!     let store = migrator.store(session);
//!
//!     let summary = migrator.migrate(session, &store, None, false)?;
//!     println!("now at version {}", summary.to_version);
//!     print!("{}", migrator.status(&store)?);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod checksum;
pub mod cql;
pub mod error;
pub mod executor;
pub mod file;
pub mod lock;
pub mod migrator;
pub mod planner;
pub mod procedure;
pub mod record;
pub mod startup;
pub mod state_table;
pub mod status;
pub mod store;

pub use catalog::{Catalog, GapPolicy};
pub use checksum::{calculate_checksum, validate_checksum};
pub use cql::split_statements;
pub use error::{MigrationError, ProcedureError};
pub use executor::{ExecutionOutcome, MigrationBody, MigrationExecutor};
pub use file::{parse_identity, MigrationDefinition, MigrationIdentity, MigrationKind};
pub use lock::{LockGuard, LockHolder};
pub use migrator::{Migrator, RunSummary};
pub use planner::{plan, Plan, PlanAction, PlanMode};
pub use procedure::{Procedure, ProcedureLoader, ProcedureParams, ProcedureRegistry};
pub use record::{LockRecord, MigrationRecord, MigrationState};
pub use startup::startup_migrations;
pub use status::{LockStatus, PendingMigration, StatusReport};
pub use store::{CqlStateStore, StateStore};
