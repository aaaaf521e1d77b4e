//! Migrator - orchestrates catalog, planner, lock and executor
//!
//! Every command loads the catalog first and resolves its target before the
//! store is touched, so catalog errors never leave partial state behind.

use crate::config::{KeyspaceProfile, MigrationConfig};
use crate::migration::catalog::Catalog;
use crate::migration::executor::{ExecutionOutcome, MigrationExecutor};
use crate::migration::file::MigrationKind;
use crate::migration::lock::{LockGuard, LockHolder};
use crate::migration::planner::{self, Plan, PlanAction, PlanMode};
use crate::migration::procedure::{Procedure, ProcedureRegistry};
use crate::migration::record::{MigrationRecord, MigrationState};
use crate::migration::status::StatusReport;
use crate::migration::store::{CqlStateStore, StateStore};
use crate::migration::MigrationError;
use crate::session::Session;
#[cfg(feature = "tracing")]
use crate::tracing_helpers;
use chrono::Utc;
use std::path::PathBuf;

/// Outcome of a `migrate`, `reset` or `baseline` run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub action: PlanAction,
    /// Current version before the run
    pub from_version: i64,
    /// Current version after the run
    pub to_version: i64,
    /// Versions executed (or baselined), in order
    pub versions: Vec<i64>,
}

impl RunSummary {
    fn empty(plan: &Plan<'_>) -> Self {
        Self {
            action: plan.action,
            from_version: plan.current_version,
            to_version: plan.current_version,
            versions: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Core migration engine
///
/// The `Migrator` orchestrates catalog discovery, planning, locking and
/// execution for one keyspace. Each command receives the session and the
/// state store explicitly; nothing is shared between invocations.
#[derive(Debug)]
pub struct Migrator {
    config: MigrationConfig,
    profile: KeyspaceProfile,
    procedures: ProcedureRegistry,
    holder: LockHolder,
}

impl Migrator {
    /// Create a migrator for `config`, creating the keyspace with `profile_name` if needed
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if the configuration is invalid or the
    /// profile does not exist.
    pub fn new(config: MigrationConfig, profile_name: &str) -> Result<Self, MigrationError> {
        config.validate()?;
        let profile = config.profile(profile_name)?.clone();

        Ok(Self {
            config,
            profile,
            procedures: ProcedureRegistry::new(),
            holder: LockHolder::current(),
        })
    }

    #[must_use]
    pub fn with_procedures(mut self, procedures: ProcedureRegistry) -> Self {
        self.procedures = procedures;
        self
    }

    /// Override the lock holder identity (e.g. a pod name)
    #[must_use]
    pub fn with_holder(mut self, holder: LockHolder) -> Self {
        self.holder = holder;
        self
    }

    /// Register the entry point of a procedural migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::AlreadyRegistered` if the version is taken.
    pub fn register_procedure(
        &mut self,
        version: i64,
        procedure: impl Procedure + 'static,
    ) -> Result<(), MigrationError> {
        self.procedures.register(version, procedure)
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// State store backed by `session`, configured like this migrator
    pub fn store<'s>(&self, session: &'s dyn Session) -> CqlStateStore<'s> {
        CqlStateStore::new(session, &self.config)
    }

    /// Load the migration catalog from the configured directory
    ///
    /// # Errors
    ///
    /// Returns any catalog error (`Io`, `MalformedName`, `DuplicateVersion`, `Sequence`).
    pub fn catalog(&self) -> Result<Catalog, MigrationError> {
        Catalog::load(&self.config.migrations_path, self.config.gap_policy)
    }

    fn resolve_target(catalog: &Catalog, target: Option<&str>) -> Result<Option<i64>, MigrationError> {
        target.map(|t| catalog.resolve_target(t)).transpose()
    }

    /// Apply pending migrations up to `target` (default: latest)
    ///
    /// With `force`, a held lock is cleared and `RUNNING`/`FAILED` versions are
    /// re-attempted. Only use it after checking the schema by hand.
    ///
    /// # Errors
    ///
    /// Fails with the first catalog, planning, lock or execution error. An
    /// `ExecutionFault` has already been recorded as `FAILED` when returned.
    pub fn migrate(
        &self,
        session: &dyn Session,
        store: &dyn StateStore,
        target: Option<&str>,
        force: bool,
    ) -> Result<RunSummary, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::command_span("migrate", &self.config.keyspace).entered();

        let catalog = self.catalog()?;
        let target = Self::resolve_target(&catalog, target)?;
        let mode = if force { PlanMode::Force } else { PlanMode::Migrate };

        store.ensure_schema(&self.profile)?;
        self.locked(store, force, |store| {
            self.execute_plan(session, store, &catalog, target, mode)
        })
    }

    /// Drop the keyspace, then migrate from scratch up to `target`
    ///
    /// # Errors
    ///
    /// Returns `LockContention` without dropping anything if another instance
    /// holds the lock. Otherwise the same as [`Migrator::migrate`].
    pub fn reset(
        &self,
        session: &dyn Session,
        store: &dyn StateStore,
        target: Option<&str>,
    ) -> Result<RunSummary, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::command_span("reset", &self.config.keyspace).entered();

        let catalog = self.catalog()?;
        let target = Self::resolve_target(&catalog, target)?;

        Self::ensure_unlocked(store)?;
        log::warn!("Resetting keyspace '{}'", self.config.keyspace);
        store.drop_schema()?;
        store.ensure_schema(&self.profile)?;
        self.locked(store, false, |store| {
            self.execute_plan(session, store, &catalog, target, PlanMode::Migrate)
        })
    }

    /// Drop the keyspace, including all migration state
    ///
    /// # Errors
    ///
    /// Returns `LockContention` if another instance holds the lock, and
    /// `Connectivity` or `Database` if the drop fails.
    pub fn clear(&self, store: &dyn StateStore) -> Result<(), MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::command_span("clear", &self.config.keyspace).entered();

        Self::ensure_unlocked(store)?;
        store.drop_schema()?;
        log::info!("Keyspace '{}' cleared", self.config.keyspace);
        Ok(())
    }

    /// Mark migrations up to `target` as applied without executing them
    ///
    /// Used to adopt a keyspace whose schema was created by other means.
    ///
    /// # Errors
    ///
    /// Fails with catalog, planning or lock errors; a `RUNNING`/`FAILED`
    /// record blocks baselining.
    pub fn baseline(
        &self,
        store: &dyn StateStore,
        target: Option<&str>,
    ) -> Result<RunSummary, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::command_span("baseline", &self.config.keyspace).entered();

        let catalog = self.catalog()?;
        let target = Self::resolve_target(&catalog, target)?;

        store.ensure_schema(&self.profile)?;
        self.locked(store, false, |store| {
            let records = store.read_all_records()?;
            let plan = planner::plan(&catalog, &records, target, PlanMode::Baseline)?;
            let mut summary = RunSummary::empty(&plan);

            for definition in &plan.pending {
                log::info!("Baselining migration {definition}");
                store.upsert_record(&MigrationRecord::for_definition(
                    definition,
                    MigrationState::Success,
                    Utc::now(),
                ))?;
                summary.versions.push(definition.version);
                summary.to_version = definition.version;
            }
            Ok(summary)
        })
    }

    /// Report applied, failed and pending migrations plus the lock state
    ///
    /// Never writes to the store, so it works on a keyspace that does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails with catalog or store errors.
    pub fn status(&self, store: &dyn StateStore) -> Result<StatusReport, MigrationError> {
        let catalog = self.catalog()?;
        let keyspace = &self.config.keyspace;
        let table = &self.config.migrations_table;

        if !store.schema_exists()? {
            return Ok(StatusReport::uninitialized(keyspace, table, &catalog));
        }

        let records = store.read_all_records()?;
        let lock = store.read_lock()?;
        Ok(StatusReport::new(keyspace, table, &catalog, &records, lock, Utc::now()))
    }

    /// Create a new migration file with the next version
    ///
    /// # Errors
    ///
    /// Fails if the catalog is invalid or the file cannot be created.
    pub fn generate(&self, description: &str, kind: MigrationKind) -> Result<PathBuf, MigrationError> {
        let directory = &self.config.migrations_path;
        let catalog = if directory.exists() {
            self.catalog()?
        } else {
            Catalog::default()
        };

        catalog.generate(
            directory,
            &self.config.new_migration_name,
            self.config.version_width,
            description,
            kind,
        )
    }

    /// Fail with `LockContention` if the lock row is held
    fn ensure_unlocked(store: &dyn StateStore) -> Result<(), MigrationError> {
        if !store.schema_exists()? {
            return Ok(());
        }
        match store.read_lock()? {
            Some(lock) => {
                log::error!(
                    "Refusing to drop keyspace: migration lock is held by '{}' since {}",
                    lock.holder,
                    lock.acquired_at.to_rfc3339()
                );
                Err(MigrationError::LockContention {
                    holder: lock.holder,
                    acquired_at: lock.acquired_at.to_rfc3339(),
                })
            }
            None => Ok(()),
        }
    }

    /// Run `body` while holding the migration lock, releasing it afterwards
    /// whether or not `body` succeeded
    fn locked<T>(
        &self,
        store: &dyn StateStore,
        force: bool,
        body: impl FnOnce(&dyn StateStore) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        let guard = LockGuard::acquire(store, self.holder.clone(), force)?;
        let result = body(store);
        let released = guard.release();

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Err(release_err)) => {
                log::error!("Failed to release migration lock after error: {release_err}");
                Err(err)
            }
        }
    }

    fn execute_plan(
        &self,
        session: &dyn Session,
        store: &dyn StateStore,
        catalog: &Catalog,
        target: Option<i64>,
        mode: PlanMode,
    ) -> Result<RunSummary, MigrationError> {
        let records = store.read_all_records()?;
        let plan = planner::plan(catalog, &records, target, mode)?;
        let mut summary = RunSummary::empty(&plan);

        if plan.is_empty() {
            log::info!(
                "Keyspace '{}' is up to date at version {}",
                self.config.keyspace,
                plan.current_version
            );
            return Ok(summary);
        }

        log::info!(
            "Migrating keyspace '{}' from version {} to {} ({} pending)",
            self.config.keyspace,
            plan.current_version,
            plan.target_version,
            plan.pending.len()
        );

        let executor = MigrationExecutor::new(session, store, &self.procedures, &self.config);

        // Resolve every body first so a missing procedure fails before anything runs
        let bodies = plan
            .pending
            .iter()
            .map(|definition| executor.prepare(definition))
            .collect::<Result<Vec<_>, _>>()?;

        executor.use_keyspace()?;
        for (definition, body) in plan.pending.iter().zip(&bodies) {
            match executor.apply(definition, body)? {
                ExecutionOutcome::Applied { .. } => {
                    summary.versions.push(definition.version);
                    summary.to_version = definition.version;
                }
                ExecutionOutcome::Failed(fault) => {
                    log::error!(
                        "Stopping at version {}; later migrations were not attempted",
                        definition.version
                    );
                    return Err(fault);
                }
            }
        }

        log::info!(
            "Keyspace '{}' migrated to version {}",
            self.config.keyspace,
            summary.to_version
        );
        Ok(summary)
    }
}
