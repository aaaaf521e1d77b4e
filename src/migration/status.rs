//! Migration status reporting

use crate::migration::catalog::Catalog;
use crate::migration::planner::{current_version, verify_records};
use crate::migration::record::{LockRecord, MigrationRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Represents a pending migration (not yet applied)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: i64,
    pub description: String,
    pub path: PathBuf,
    pub checksum: String,
}

/// The lock row as seen by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Seconds the lock has been held when the report was taken
    pub held_for_seconds: i64,
}

/// Snapshot of the keyspace's migration state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub keyspace: String,
    pub table: String,
    /// Whether the keyspace and state tables exist at all
    pub initialized: bool,
    /// Highest version recorded as `SUCCESS` (0 when none)
    pub current_version: i64,
    /// Highest version in the catalog (0 when empty)
    pub latest_version: i64,
    /// All records, in version order
    pub records: Vec<MigrationRecord>,
    /// Catalog migrations without a `SUCCESS` record
    pub pending: Vec<PendingMigration>,
    pub lock: Option<LockStatus>,
    /// Why the records disagree with the catalog (edited or missing files)
    ///
    /// A plain `migrate` fails with this error until it is resolved.
    pub verification_error: Option<String>,
}

impl StatusReport {
    /// Report for a keyspace whose state tables do not exist yet
    #[must_use]
    pub fn uninitialized(keyspace: &str, table: &str, catalog: &Catalog) -> Self {
        Self::new(keyspace, table, catalog, &BTreeMap::new(), None, Utc::now()).with_initialized(false)
    }

    #[must_use]
    pub fn new(
        keyspace: &str,
        table: &str,
        catalog: &Catalog,
        records: &BTreeMap<i64, MigrationRecord>,
        lock: Option<LockRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let pending = catalog
            .iter()
            .filter(|m| !records.get(&m.version).is_some_and(MigrationRecord::is_success))
            .map(|m| PendingMigration {
                version: m.version,
                description: m.description.clone(),
                path: m.path.clone(),
                checksum: m.checksum.clone(),
            })
            .collect();

        Self {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            initialized: true,
            current_version: current_version(records),
            latest_version: catalog.latest_version().unwrap_or(0),
            records: records.values().cloned().collect(),
            pending,
            lock: lock.map(|l| LockStatus {
                held_for_seconds: l.age(now).num_seconds(),
                holder: l.holder,
                acquired_at: l.acquired_at,
            }),
            verification_error: verify_records(catalog, records).err().map(|e| e.to_string()),
        }
    }

    fn with_initialized(mut self, initialized: bool) -> Self {
        self.initialized = initialized;
        self
    }

    /// Check if all migrations are applied and match their files
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.verification_error.is_none()
    }

    /// Records that block a plain `migrate` (`RUNNING` or `FAILED`)
    pub fn unresolved(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.iter().filter(|r| !r.is_success())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Keyspace: {}", self.keyspace)?;
        writeln!(f, "Migration table: {}", self.table)?;
        if !self.initialized {
            writeln!(f, "Keyspace has not been initialized")?;
        }
        writeln!(f, "Current version: {}", self.current_version)?;
        writeln!(f, "Latest version: {}", self.latest_version)?;

        match &self.lock {
            Some(lock) => writeln!(
                f,
                "Lock: held by {} since {} ({}s)",
                lock.holder,
                lock.acquired_at.to_rfc3339(),
                lock.held_for_seconds
            )?,
            None => writeln!(f, "Lock: free")?,
        }
        if let Some(error) = &self.verification_error {
            writeln!(f, "Verification failed: {error}")?;
        }

        if !self.records.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "{:<10} {:<32} {:<8} {:<25} {:<12}",
                "VERSION", "DESCRIPTION", "STATE", "DATE", "CHECKSUM"
            )?;
            for record in &self.records {
                writeln!(
                    f,
                    "{:<10} {:<32} {:<8} {:<25} {:<12}",
                    record.version,
                    record.description,
                    record.state.as_str(),
                    record.applied_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.checksum.get(..12).unwrap_or(record.checksum.as_str())
                )?;
            }
        }

        if !self.pending.is_empty() {
            writeln!(f)?;
            writeln!(f, "Pending migrations:")?;
            for pending in &self.pending {
                writeln!(f, "  {:<10} {}", pending.version, pending.description)?;
            }
        }
        Ok(())
    }
}
