//! In-memory collaborators for tests
//!
//! [`MemoryStateStore`] is a linearizable [`StateStore`] behind a mutex, and
//! [`RecordingSession`] is a [`Session`] that records every statement and
//! answers from scripted rules. Downstream test suites enable them with the
//! `test-helpers` feature.

use crate::config::KeyspaceProfile;
use crate::migration::lock::LockHolder;
use crate::migration::record::{LockRecord, MigrationRecord, MigrationState};
use crate::migration::store::StateStore;
use crate::migration::MigrationError;
use crate::session::{ResultSet, Session, SessionError, Statement};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    schema: bool,
    records: BTreeMap<i64, MigrationRecord>,
    /// Every state written, per version, in order
    history: BTreeMap<i64, Vec<MigrationState>>,
    lock: Option<LockRecord>,
    drops: usize,
}

/// `StateStore` kept in process memory
///
/// Lock acquisition and release are compare-and-swap operations under one
/// mutex, matching the guarantees of lightweight transactions.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all records
    pub fn records(&self) -> BTreeMap<i64, MigrationRecord> {
        self.state().records.clone()
    }

    /// States written for `version`, oldest first
    pub fn history(&self, version: i64) -> Vec<MigrationState> {
        self.state().history.get(&version).cloned().unwrap_or_default()
    }

    pub fn lock_holder(&self) -> Option<String> {
        self.state().lock.as_ref().map(|l| l.holder.clone())
    }

    /// Number of times the schema was dropped
    pub fn drop_count(&self) -> usize {
        self.state().drops
    }
}

impl StateStore for MemoryStateStore {
    fn ensure_schema(&self, _profile: &KeyspaceProfile) -> Result<(), MigrationError> {
        self.state().schema = true;
        Ok(())
    }

    fn schema_exists(&self) -> Result<bool, MigrationError> {
        Ok(self.state().schema)
    }

    fn drop_schema(&self) -> Result<(), MigrationError> {
        let mut state = self.state();
        let drops = state.drops + 1;
        *state = MemoryState {
            drops,
            ..MemoryState::default()
        };
        Ok(())
    }

    fn read_all_records(&self) -> Result<BTreeMap<i64, MigrationRecord>, MigrationError> {
        Ok(self.records())
    }

    fn upsert_record(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let mut state = self.state();
        state
            .history
            .entry(record.version)
            .or_default()
            .push(record.state);
        state.records.insert(record.version, record.clone());
        Ok(())
    }

    fn read_lock(&self) -> Result<Option<LockRecord>, MigrationError> {
        Ok(self.state().lock.clone())
    }

    fn try_acquire_lock(&self, holder: &LockHolder) -> Result<bool, MigrationError> {
        let mut state = self.state();
        if state.lock.is_some() {
            return Ok(false);
        }
        state.lock = Some(LockRecord {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        });
        Ok(true)
    }

    fn release_lock(&self, holder: &LockHolder) -> Result<(), MigrationError> {
        let mut state = self.state();
        match state.lock.as_ref() {
            Some(lock) if lock.holder == holder.as_str() => {
                state.lock = None;
                Ok(())
            }
            other => Err(MigrationError::LockOwnership {
                expected: holder.to_string(),
                actual: other.map(|l| l.holder.clone()),
            }),
        }
    }

    fn force_clear_lock(&self) -> Result<(), MigrationError> {
        self.state().lock = None;
        Ok(())
    }
}

/// `Session` that records statements and replies from scripted rules
///
/// A rule matches when the statement's CQL contains its fragment; the first
/// matching rule wins. Statements matching no rule succeed with no rows.
#[derive(Debug, Default)]
pub struct RecordingSession {
    executed: Mutex<Vec<Statement>>,
    rules: Mutex<Vec<(String, Result<ResultSet, SessionError>)>>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements containing `fragment` with `result`
    pub fn respond(&self, fragment: impl Into<String>, result: ResultSet) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fragment.into(), Ok(result)));
    }

    /// Fail statements containing `fragment` with `error`
    pub fn fail(&self, fragment: impl Into<String>, error: SessionError) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fragment.into(), Err(error)));
    }

    /// All statements executed so far, including failed ones
    pub fn executed(&self) -> Vec<Statement> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn executed_cql(&self) -> Vec<String> {
        self.executed().into_iter().map(|s| s.cql).collect()
    }
}

impl Session for RecordingSession {
    fn execute(&self, statement: &Statement) -> Result<ResultSet, SessionError> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement.clone());

        let rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .find(|(fragment, _)| statement.cql.contains(fragment.as_str()))
            .map_or_else(|| Ok(ResultSet::empty()), |(_, result)| result.clone())
    }
}
