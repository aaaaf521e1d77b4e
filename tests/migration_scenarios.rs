//! End-to-end migration scenarios
//!
//! These tests drive the `Migrator` against an in-memory state store and a
//! recording session, with migration files in a temporary directory.

use harbormaster::config::MigrationConfig;
use harbormaster::migration::{
    plan, LockHolder, MigrationError, MigrationRecord, MigrationState, Migrator, PlanMode,
    ProcedureError, ProcedureParams, StateStore,
};
use harbormaster::session::{Session, SessionError, Statement};
use harbormaster::test_helpers::{MemoryStateStore, RecordingSession};
use chrono::Utc;
use std::fs;
use tempfile::TempDir;

fn migrations_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn migrator(dir: &TempDir) -> Migrator {
    let mut config = MigrationConfig::new("app");
    config.migrations_path = dir.path().to_path_buf();
    Migrator::new(config, "dev")
        .unwrap()
        .with_holder(LockHolder::new("scenario"))
}

const THREE_STEPS: [(&str, &str); 3] = [
    ("v001_users.cql", "CREATE TABLE users (id uuid PRIMARY KEY, email text);"),
    ("v002_orders.cql", "CREATE TABLE orders (id uuid PRIMARY KEY);\nALTER TABLE orders ADD total decimal;"),
    ("v003_payments.cql", "CREATE TABLE payments (id uuid PRIMARY KEY);"),
];

#[test]
fn test_failed_migration_stops_the_run() {
    let dir = migrations_dir(&THREE_STEPS);
    let session = RecordingSession::new();
    session.fail("ALTER TABLE orders", SessionError::query("Invalid column type"));
    let store = MemoryStateStore::new();

    let err = migrator(&dir)
        .migrate(&session, &store, None, false)
        .unwrap_err();
    match err {
        MigrationError::ExecutionFault { version, statement, .. } => {
            assert_eq!(version, 2);
            assert_eq!(statement, Some(1));
        }
        other => panic!("expected ExecutionFault, got {other:?}"),
    }

    let records = store.records();
    assert_eq!(records[&1].state, MigrationState::Success);
    assert_eq!(records[&2].state, MigrationState::Failed);
    assert!(!records.contains_key(&3));
    assert!(!session
        .executed_cql()
        .iter()
        .any(|cql| cql.contains("payments")));

    // The FAILED record marks the failure; the lock itself is released
    assert!(store.lock_holder().is_none());
}

#[test]
fn test_prior_failure_requires_force() {
    let dir = migrations_dir(&THREE_STEPS[..2]);
    let migrator = migrator(&dir);
    let store = MemoryStateStore::new();

    let catalog = migrator.catalog().unwrap();
    store
        .upsert_record(&MigrationRecord::for_definition(
            catalog.get(1).unwrap(),
            MigrationState::Failed,
            Utc::now(),
        ))
        .unwrap();

    let session = RecordingSession::new();
    assert!(matches!(
        migrator.migrate(&session, &store, None, false),
        Err(MigrationError::PriorFailure { version: 1, state: MigrationState::Failed, .. })
    ));
    assert_eq!(store.history(1), vec![MigrationState::Failed]);
    assert!(store.history(2).is_empty());
    assert!(session.executed().is_empty());

    let summary = migrator.migrate(&session, &store, None, true).unwrap();
    assert_eq!(summary.versions, vec![1, 2]);
    assert_eq!(
        store.history(1),
        vec![MigrationState::Failed, MigrationState::Running, MigrationState::Success]
    );
    assert_eq!(store.records()[&2].state, MigrationState::Success);
}

#[test]
fn test_force_clears_a_stale_lock() {
    let dir = migrations_dir(&THREE_STEPS[..1]);
    let store = MemoryStateStore::new();
    let crashed = LockHolder::new("crashed-pod");
    assert!(store.try_acquire_lock(&crashed).unwrap());

    let session = RecordingSession::new();
    assert!(matches!(
        migrator(&dir).migrate(&session, &store, None, false),
        Err(MigrationError::LockContention { holder, .. }) if holder == crashed.to_string()
    ));

    let summary = migrator(&dir).migrate(&session, &store, None, true).unwrap();
    assert_eq!(summary.versions, vec![1]);
    assert!(store.lock_holder().is_none());
}

#[test]
fn test_baseline_marks_without_executing() {
    let dir = migrations_dir(&THREE_STEPS);
    let session = RecordingSession::new();
    let store = MemoryStateStore::new();

    let summary = migrator(&dir).baseline(&store, Some("2")).unwrap();
    assert_eq!(summary.versions, vec![1, 2]);

    let records = store.records();
    assert_eq!(records.len(), 2);
    assert!(records.values().all(|r| r.is_success() && r.execution_time_ms.is_none()));
    assert!(!records.contains_key(&3));
    assert!(session.executed().is_empty());

    // The next migrate picks up where the baseline stopped
    let summary = migrator(&dir).migrate(&session, &store, None, false).unwrap();
    assert_eq!(summary.versions, vec![3]);
    assert_eq!(summary.from_version, 2);
}

#[test]
fn test_edited_migration_is_detected() {
    let dir = migrations_dir(&THREE_STEPS[..2]);
    let session = RecordingSession::new();
    let store = MemoryStateStore::new();
    migrator(&dir).migrate(&session, &store, Some("1"), false).unwrap();

    fs::write(
        dir.path().join("v001_users.cql"),
        "CREATE TABLE users (id uuid PRIMARY KEY, email text, name text);",
    )
    .unwrap();
    let executed_before = session.executed().len();

    let status = migrator(&dir).status(&store).unwrap();
    assert!(!status.is_up_to_date());
    assert!(status
        .verification_error
        .as_deref()
        .is_some_and(|e| e.contains("modified after being applied")));

    assert!(matches!(
        migrator(&dir).migrate(&session, &store, None, false),
        Err(MigrationError::ChecksumMismatch { version: 1, .. })
    ));
    assert_eq!(session.executed().len(), executed_before);
    assert!(!store.records().contains_key(&2));
}

#[test]
fn test_plan_after_full_migration_is_empty() {
    let dir = migrations_dir(&THREE_STEPS);
    let session = RecordingSession::new();
    let store = MemoryStateStore::new();
    let migrator = migrator(&dir);
    let catalog = migrator.catalog().unwrap();

    let before = store.read_all_records().unwrap();
    let first = plan(&catalog, &before, None, PlanMode::Migrate).unwrap();
    let second = plan(&catalog, &before, None, PlanMode::Migrate).unwrap();
    assert_eq!(first.versions(), second.versions());

    migrator.migrate(&session, &store, None, false).unwrap();
    let after = store.read_all_records().unwrap();
    assert!(plan(&catalog, &after, None, PlanMode::Migrate).unwrap().is_empty());
}

#[test]
fn test_procedural_migration_runs_in_order() {
    let dir = migrations_dir(&[
        ("v001_users.cql", "CREATE TABLE users (id uuid PRIMARY KEY, email text);"),
        ("v002_backfill_emails.rs", "//! lowercase all emails"),
    ]);
    let mut migrator = migrator(&dir);
    migrator
        .register_procedure(
            2,
            |session: &dyn Session, params: &ProcedureParams| -> Result<(), ProcedureError> {
                assert!(params.is_empty());
                session.execute(&Statement::new("UPDATE users SET email = ? WHERE id = ?"))?;
                Ok(())
            },
        )
        .unwrap();

    let session = RecordingSession::new();
    let store = MemoryStateStore::new();
    let summary = migrator.migrate(&session, &store, None, false).unwrap();

    assert_eq!(summary.versions, vec![1, 2]);
    let cql = session.executed_cql();
    assert_eq!(cql.len(), 3);
    assert!(cql[1].starts_with("CREATE TABLE users"));
    assert!(cql[2].starts_with("UPDATE users"));
    assert_eq!(store.records()[&2].kind.as_str(), "PROCEDURAL");
}

#[test]
fn test_stored_version_without_file() {
    let dir = migrations_dir(&THREE_STEPS[..2]);
    let session = RecordingSession::new();
    let store = MemoryStateStore::new();
    migrator(&dir).migrate(&session, &store, None, false).unwrap();

    fs::remove_file(dir.path().join("v002_orders.cql")).unwrap();
    assert!(matches!(
        migrator(&dir).migrate(&session, &store, None, false),
        Err(MigrationError::UnknownMigration { version: 2, .. })
    ));
}

#[test]
fn test_panicking_procedure_is_recorded_and_unlocks() {
    let dir = migrations_dir(&[("v001_backfill.rs", "//! backfill")]);
    let mut migrator = migrator(&dir);
    migrator
        .register_procedure(
            1,
            |_: &dyn Session, _: &ProcedureParams| -> Result<(), ProcedureError> {
                panic!("backfill hit a corrupt row")
            },
        )
        .unwrap();

    let session = RecordingSession::new();
    let store = MemoryStateStore::new();
    assert!(matches!(
        migrator.migrate(&session, &store, None, false),
        Err(MigrationError::ExecutionFault { version: 1, .. })
    ));
    assert_eq!(store.records()[&1].state, MigrationState::Failed);
    assert!(store.lock_holder().is_none());
}
