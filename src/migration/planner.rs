//! Migration planner - reconciles the catalog with the recorded state
//!
//! Planning is pure: it reads a catalog and a snapshot of the records and
//! either fails or returns the ordered list of migrations to act on. Nothing
//! is written until a plan exists.

use crate::migration::catalog::Catalog;
use crate::migration::checksum::validate_checksum;
use crate::migration::file::MigrationDefinition;
use crate::migration::record::MigrationRecord;
use crate::migration::MigrationError;
use std::collections::BTreeMap;

/// How the plan treats the recorded state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Refuse to continue over a `RUNNING` or `FAILED` record
    Migrate,
    /// Re-attempt `RUNNING`/`FAILED` versions from the lowest one forward
    Force,
    /// Mark versions as applied without executing them
    Baseline,
}

/// What the orchestrator should do with the pending migrations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Run each migration through the executor
    Execute,
    /// Write `SUCCESS` records without running anything
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<'c> {
    pub action: PlanAction,
    /// Highest version recorded as `SUCCESS` (0 when none)
    pub current_version: i64,
    pub target_version: i64,
    /// Migrations to act on, in ascending version order
    pub pending: Vec<&'c MigrationDefinition>,
}

impl Plan<'_> {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.pending.iter().map(|m| m.version).collect()
    }
}

/// Reconcile `catalog` with `records` and compute the pending migrations
///
/// `target` defaults to the latest catalog version. A target below the
/// current version yields an empty plan.
///
/// # Errors
///
/// - `UnknownMigration` if a record has no catalog entry
/// - `ChecksumMismatch` if a `SUCCESS` record no longer matches its file
/// - `PriorFailure` if a record is `RUNNING`/`FAILED` and `mode` is not `Force`
/// - `InconsistentHistory` if a catalog version below the current one was never recorded
/// - `InvalidTarget` if `target` is not a catalog version
pub fn plan<'c>(
    catalog: &'c Catalog,
    records: &BTreeMap<i64, MigrationRecord>,
    target: Option<i64>,
    mode: PlanMode,
) -> Result<Plan<'c>, MigrationError> {
    verify_records(catalog, records)?;

    if mode != PlanMode::Force {
        if let Some(record) = records.values().find(|r| !r.is_success()) {
            return Err(MigrationError::PriorFailure {
                version: record.version,
                description: record.description.clone(),
                state: record.state,
            });
        }
    }

    let current_version = current_version(records);
    if let Some(missing) = catalog
        .iter()
        .take_while(|m| m.version < current_version)
        .find(|m| !records.contains_key(&m.version))
    {
        return Err(MigrationError::InconsistentHistory {
            version: missing.version,
            applied: current_version,
        });
    }

    let target_version = match target {
        Some(version) if catalog.get(version).is_none() => {
            return Err(MigrationError::InvalidTarget(version.to_string()));
        }
        Some(version) => version,
        None => catalog.latest_version().unwrap_or(0),
    };

    if target_version < current_version {
        log::info!(
            "Target version {target_version} is below current version {current_version}, nothing to do"
        );
    }

    let pending = catalog
        .iter()
        .take_while(|m| m.version <= target_version)
        .filter(|m| !records.get(&m.version).is_some_and(MigrationRecord::is_success))
        .collect();

    let action = match mode {
        PlanMode::Baseline => PlanAction::Baseline,
        PlanMode::Migrate | PlanMode::Force => PlanAction::Execute,
    };

    Ok(Plan {
        action,
        current_version,
        target_version,
        pending,
    })
}

/// Every record must have a catalog entry, and `SUCCESS` records must still
/// match their file
///
/// # Errors
///
/// Returns `UnknownMigration` or `ChecksumMismatch` for the lowest offending version.
pub fn verify_records(
    catalog: &Catalog,
    records: &BTreeMap<i64, MigrationRecord>,
) -> Result<(), MigrationError> {
    for record in records.values() {
        let Some(definition) = catalog.get(record.version) else {
            return Err(MigrationError::UnknownMigration {
                version: record.version,
                description: record.description.clone(),
            });
        };

        if record.is_success() {
            validate_checksum(
                record.version,
                &record.description,
                &record.checksum,
                &definition.checksum,
            )?;
        }
    }
    Ok(())
}

/// Highest version recorded as `SUCCESS`, or 0
pub fn current_version(records: &BTreeMap<i64, MigrationRecord>) -> i64 {
    records
        .values()
        .filter(|r| r.is_success())
        .map(|r| r.version)
        .max()
        .unwrap_or(0)
}
