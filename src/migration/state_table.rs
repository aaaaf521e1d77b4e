//! CQL for the migration keyspace, state table and lock table
//!
//! The state table stores one row per applied or attempted migration:
//! - Version (partition key)
//! - Description
//! - Checksum (SHA-256 of the migration file)
//! - Kind (statement script or procedural)
//! - State (RUNNING, SUCCESS, FAILED)
//! - Time of the last state transition
//! - Execution time
//!
//! The lock table holds at most one row, keyed by [`LOCK_ID`]. Its existence is
//! the lock.

use crate::config::KeyspaceProfile;

/// Key of the singleton lock row
pub const LOCK_ID: &str = "migration";

/// Quote a CQL identifier, doubling embedded quotes
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Fully qualified, quoted table reference
pub fn qualified(keyspace: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(keyspace), quote_identifier(table))
}

pub fn create_keyspace(keyspace: &str, profile: &KeyspaceProfile) -> String {
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = {} AND DURABLE_WRITES = {}",
        quote_identifier(keyspace),
        profile.replication_cql(),
        profile.durable_writes
    )
}

pub fn drop_keyspace(keyspace: &str) -> String {
    format!("DROP KEYSPACE IF EXISTS {}", quote_identifier(keyspace))
}

/// Create the state table
///
/// Row caching is disabled so every read observes the latest write.
pub fn create_state_table(keyspace: &str, table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         version bigint PRIMARY KEY, \
         description text, \
         checksum text, \
         kind text, \
         state text, \
         applied_at timestamp, \
         execution_time_ms bigint\
         ) WITH caching = {{'keys': 'NONE', 'rows_per_partition': 'NONE'}}",
        qualified(keyspace, table)
    )
}

pub fn create_lock_table(keyspace: &str, lock_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         lock_id text PRIMARY KEY, \
         holder text, \
         acquired_at timestamp\
         ) WITH caching = {{'keys': 'NONE', 'rows_per_partition': 'NONE'}}",
        qualified(keyspace, lock_table)
    )
}

/// Lists which of the state tables exist; binds keyspace name
pub fn select_existing_tables() -> &'static str {
    "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?"
}

pub fn select_records(keyspace: &str, table: &str) -> String {
    format!(
        "SELECT version, description, checksum, kind, state, applied_at, execution_time_ms FROM {}",
        qualified(keyspace, table)
    )
}

/// Binds version, description, checksum, kind, state, applied_at, execution_time_ms
pub fn upsert_record(keyspace: &str, table: &str) -> String {
    format!(
        "INSERT INTO {} (version, description, checksum, kind, state, applied_at, execution_time_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        qualified(keyspace, table)
    )
}

/// Binds lock id
pub fn select_lock(keyspace: &str, lock_table: &str) -> String {
    format!(
        "SELECT holder, acquired_at FROM {} WHERE lock_id = ?",
        qualified(keyspace, lock_table)
    )
}

/// Conditional insert; binds lock id, holder, acquired_at
pub fn insert_lock(keyspace: &str, lock_table: &str) -> String {
    format!(
        "INSERT INTO {} (lock_id, holder, acquired_at) VALUES (?, ?, ?) IF NOT EXISTS",
        qualified(keyspace, lock_table)
    )
}

/// Conditional delete; binds lock id, expected holder
pub fn delete_lock_if_holder(keyspace: &str, lock_table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE lock_id = ? IF holder = ?",
        qualified(keyspace, lock_table)
    )
}

/// Unconditional delete; binds lock id
pub fn delete_lock(keyspace: &str, lock_table: &str) -> String {
    format!("DELETE FROM {} WHERE lock_id = ?", qualified(keyspace, lock_table))
}

pub fn use_keyspace(keyspace: &str) -> String {
    format!("USE {}", quote_identifier(keyspace))
}
