//! Procedural migrations and the registry that resolves them
//!
//! A procedural migration is a `.rs` file in the migrations directory. The file
//! gives the migration its version, description and checksum; the code itself is
//! compiled into the application and registered under the same version, so the
//! executor can look it up when the file is due.

use crate::migration::error::ProcedureError;
use crate::migration::file::MigrationDefinition;
use crate::migration::MigrationError;
use crate::session::Session;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Arbitrary keyword parameters handed to every procedure
pub type ProcedureParams = BTreeMap<String, serde_json::Value>;

/// The single entry point of a procedural migration
///
/// Any error returned is recorded as a failed migration, exactly like a
/// failing statement in a `.cql` script.
///
/// # Example
///
/// ```rust,no_run
/// use harbormaster::migration::{Procedure, ProcedureError, ProcedureParams};
/// use harbormaster::session::{Session, Statement};
///
/// struct BackfillEmails;
///
/// impl Procedure for BackfillEmails {
///     fn execute(&self, session: &dyn Session, params: &ProcedureParams) -> Result<(), ProcedureError> {
///         let batch = params.get("batch_size").and_then(|v| v.as_i64()).unwrap_or(100);
///         session.execute(&Statement::new("SELECT id FROM users LIMIT ?").bind(batch as i32))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Procedure: Send + Sync {
    fn execute(&self, session: &dyn Session, params: &ProcedureParams) -> Result<(), ProcedureError>;
}

impl<F> Procedure for F
where
    F: Fn(&dyn Session, &ProcedureParams) -> Result<(), ProcedureError> + Send + Sync,
{
    fn execute(&self, session: &dyn Session, params: &ProcedureParams) -> Result<(), ProcedureError> {
        self(session, params)
    }
}

/// Capability that resolves a procedural definition to its entry point
pub trait ProcedureLoader {
    /// # Errors
    ///
    /// Returns `MigrationError::UnknownProcedure` if nothing can run `definition`.
    fn load(&self, definition: &MigrationDefinition) -> Result<Arc<dyn Procedure>, MigrationError>;
}

/// In-process registry of procedures, indexed by migration version
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<i64, Arc<dyn Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the procedure for a migration version
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::AlreadyRegistered` if the version is taken.
    pub fn register(
        &mut self,
        version: i64,
        procedure: impl Procedure + 'static,
    ) -> Result<(), MigrationError> {
        if self.procedures.contains_key(&version) {
            return Err(MigrationError::AlreadyRegistered(version));
        }
        self.procedures.insert(version, Arc::new(procedure));
        Ok(())
    }

    pub fn is_registered(&self, version: i64) -> bool {
        self.procedures.contains_key(&version)
    }

    /// All registered versions, sorted
    pub fn versions(&self) -> Vec<i64> {
        let mut versions: Vec<i64> = self.procedures.keys().copied().collect();
        versions.sort_unstable();
        versions
    }
}

impl ProcedureLoader for ProcedureRegistry {
    fn load(&self, definition: &MigrationDefinition) -> Result<Arc<dyn Procedure>, MigrationError> {
        self.procedures
            .get(&definition.version)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownProcedure {
                version: definition.version,
                description: definition.description.clone(),
            })
    }
}

impl fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("versions", &self.versions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::file::{MigrationIdentity, MigrationKind};
    use crate::test_helpers::RecordingSession;
    use std::path::PathBuf;

    fn definition(version: i64) -> MigrationDefinition {
        MigrationDefinition::new(
            MigrationIdentity {
                version,
                description: "backfill".to_string(),
                kind: MigrationKind::Procedural,
            },
            PathBuf::from(format!("v{version:03}_backfill.rs")),
            "//! backfill".to_string(),
        )
    }

    #[test]
    fn test_register_and_load() {
        let mut registry = ProcedureRegistry::new();
        registry
            .register(2, |_: &dyn Session, _: &ProcedureParams| -> Result<(), ProcedureError> { Ok(()) })
            .unwrap();

        assert!(registry.is_registered(2));
        assert_eq!(registry.versions(), vec![2]);

        let procedure = registry.load(&definition(2)).unwrap();
        let session = RecordingSession::new();
        assert!(procedure.execute(&session, &ProcedureParams::new()).is_ok());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = ProcedureRegistry::new();
        let noop = |_: &dyn Session, _: &ProcedureParams| -> Result<(), ProcedureError> { Ok(()) };
        registry.register(1, noop).unwrap();
        assert!(matches!(
            registry.register(1, noop),
            Err(MigrationError::AlreadyRegistered(1))
        ));
    }

    #[test]
    fn test_unknown_procedure() {
        let registry = ProcedureRegistry::new();
        assert!(matches!(
            registry.load(&definition(5)),
            Err(MigrationError::UnknownProcedure { version: 5, .. })
        ));
    }
}
