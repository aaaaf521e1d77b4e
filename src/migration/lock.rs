//! Migration lock built on the state store's conditional writes
//!
//! The lock is a single row. Whoever inserts it holds the lock; nobody waits
//! for it and it never expires. A row left behind by a crashed process is the
//! visible marker of an interrupted run, cleared only by an explicit `force`.

use crate::migration::store::StateStore;
use crate::migration::MigrationError;
use std::fmt;
use std::path::Path;

const HOSTNAME_FILES: [&str; 2] = ["/etc/hostname", "/proc/sys/kernel/hostname"];

/// Identity of the instance holding the lock: `host:pid:nonce`
///
/// The random nonce tells two runs of the same process apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHolder(String);

impl LockHolder {
    pub fn new(host: &str) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{host}:{}:{}", std::process::id(), &nonce[..8]))
    }

    /// Holder for this process, named after the host it runs on
    pub fn current() -> Self {
        let paths = HOSTNAME_FILES.map(Path::new);
        let host = resolve_host(|name| std::env::var(name).ok(), &paths);
        Self::new(&host)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Host name from the environment, then the system files, then a placeholder
fn resolve_host(env: impl Fn(&str) -> Option<String>, files: &[&Path]) -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|name| env(name))
        .chain(files.iter().filter_map(|path| std::fs::read_to_string(path).ok()))
        .map(|host| host.trim().to_string())
        .find(|host| !host.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Held migration lock
///
/// Release it explicitly with [`LockGuard::release`]. Dropping the guard
/// without releasing leaves the lock row in place, so an unwinding or
/// aborted run stays visible to the next one.
#[must_use = "the lock stays held until `release` is called"]
pub struct LockGuard<'a> {
    store: &'a dyn StateStore,
    holder: LockHolder,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Acquire the migration lock
    ///
    /// With `force`, a lock held by someone else is cleared first. That is
    /// only safe once the operator has confirmed the previous holder is gone.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockContention` if another holder has the lock.
    pub fn acquire(
        store: &'a dyn StateStore,
        holder: LockHolder,
        force: bool,
    ) -> Result<Self, MigrationError> {
        if force {
            if let Some(existing) = store.read_lock()? {
                log::warn!(
                    "Forcing removal of migration lock held by '{}' since {}",
                    existing.holder,
                    existing.acquired_at.to_rfc3339()
                );
                store.force_clear_lock()?;
            }
        }

        if store.try_acquire_lock(&holder)? {
            return Ok(Self {
                store,
                holder,
                released: false,
            });
        }

        let (current, acquired_at) = match store.read_lock()? {
            Some(existing) => (existing.holder, existing.acquired_at.to_rfc3339()),
            // Released between our insert and the read
            None => ("unknown".to_string(), "unknown".to_string()),
        };
        log::error!("Migration lock is held by '{current}' since {acquired_at}");
        Err(MigrationError::LockContention {
            holder: current,
            acquired_at,
        })
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Release the lock
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockOwnership` if the lock changed owner while held.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.store.release_lock(&self.holder)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "Migration lock held by '{}' was not released; re-run with force once the schema has been checked",
                self.holder
            );
        }
    }
}
