//! # Harbormaster
//!
//! Schema migrations for Cassandra-compatible clusters, safe to run from many
//! instances at once.
//!
//! Migrations are `.cql` scripts or registered Rust procedures, discovered
//! from a directory and applied in version order. Progress is recorded in a
//! state table inside the target keyspace; a single lock row written with a
//! lightweight transaction makes sure only one instance migrates at a time.
//!
//! The crate talks to the cluster through the [`session::Session`] trait, so
//! any driver can be plugged in.

pub mod config;
pub mod migration;
pub mod session;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

#[cfg(feature = "tracing")]
mod tracing_helpers;

pub use config::{KeyspaceProfile, MigrationConfig};
pub use migration::{MigrationError, Migrator};
pub use session::{Consistency, Session, SessionError, Statement};
