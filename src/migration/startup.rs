//! In-process migration execution helpers

use crate::config::MigrationConfig;
use crate::migration::migrator::{Migrator, RunSummary};
use crate::migration::procedure::ProcedureRegistry;
use crate::migration::MigrationError;
use crate::session::Session;

/// Run migrations on application startup
///
/// This function is designed to be called during application initialization
/// to apply pending migrations before serving traffic. It handles:
/// - Keyspace and state table creation
/// - Lock acquisition (one instance migrates, the others fail fast)
/// - Checksum validation of applied migrations
/// - Migration execution up to the latest version
///
/// # Behavior
///
/// - **First instance wins:** the instance that inserts the lock row runs the migrations
/// - **Other instances fail:** they get `LockContention` and should retry or exit; there is no waiting
/// - **Fail-fast:** if a migration fails, the application should not start
///
/// # Example
///
/// ```rust,no_run
/// use harbormaster::config::MigrationConfig;
/// use harbormaster::migration::{startup_migrations, ProcedureRegistry};
/// use harbormaster::session::Session;
///
/// fn boot(session: &dyn Session) -> Result<(), Box<dyn std::error::Error>> {
///     let config = MigrationConfig::load()?;
///     startup_migrations(session, config, "prod", ProcedureRegistry::new())?;
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
///
/// # Errors
///
/// Returns any error of [`Migrator::migrate`], or `Config` if `profile` is unknown.
pub fn startup_migrations(
    session: &dyn Session,
    config: MigrationConfig,
    profile: &str,
    procedures: ProcedureRegistry,
) -> Result<RunSummary, MigrationError> {
    let migrator = Migrator::new(config, profile)?.with_procedures(procedures);
    let store = migrator.store(session);

    let summary = migrator.migrate(session, &store, None, false)?;
    if summary.is_noop() {
        log::debug!("No pending migrations to apply");
    } else {
        log::info!("Applied {} migration(s) on startup", summary.versions.len());
    }
    Ok(summary)
}
