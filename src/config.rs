//! Migration configuration
//!
//! [`MigrationConfig`] can be loaded from `config/harbormaster.toml` and
//! `HARBORMASTER__*` environment variables with [`MigrationConfig::load`], or
//! built directly by the embedding application.

use crate::migration::catalog::GapPolicy;
use crate::migration::procedure::ProcedureParams;
use crate::migration::MigrationError;
use crate::session::Consistency;
use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/harbormaster.toml";
const ENV_PREFIX: &str = "HARBORMASTER";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,47}$").expect("identifier pattern is valid"));

/// A replication option value: `'SimpleStrategy'`, `3`, ...
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReplicationValue {
    Int(u32),
    Text(String),
}

impl fmt::Display for ReplicationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationValue::Int(v) => write!(f, "{v}"),
            ReplicationValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// Keyspace settings used when the keyspace has to be created
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyspaceProfile {
    /// Replication map, e.g. `{ class = "NetworkTopologyStrategy", dc1 = 3 }`
    pub replication: BTreeMap<String, ReplicationValue>,
    #[serde(default = "default_durable_writes")]
    pub durable_writes: bool,
}

impl KeyspaceProfile {
    /// Single-node development profile
    pub fn simple(replication_factor: u32) -> Self {
        let mut replication = BTreeMap::new();
        replication.insert(
            "class".to_string(),
            ReplicationValue::Text("SimpleStrategy".to_string()),
        );
        replication.insert(
            "replication_factor".to_string(),
            ReplicationValue::Int(replication_factor),
        );
        Self {
            replication,
            durable_writes: true,
        }
    }

    /// Render the replication map as a CQL map literal
    pub fn replication_cql(&self) -> String {
        let pairs: Vec<String> = self
            .replication
            .iter()
            .map(|(key, value)| format!("'{}': {}", key.replace('\'', "''"), value))
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Keyspace migrations are applied to; also holds the state tables
    pub keyspace: String,
    #[serde(default = "default_migrations_table")]
    pub migrations_table: String,
    #[serde(default = "default_migrations_path")]
    pub migrations_path: PathBuf,
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, KeyspaceProfile>,
    /// File name template for `generate`, using `{version}` and `{description}`
    #[serde(default = "default_new_migration_name")]
    pub new_migration_name: String,
    #[serde(default = "default_version_width")]
    pub version_width: usize,
    #[serde(default)]
    pub gap_policy: GapPolicy,
    #[serde(default = "default_consistency")]
    pub consistency: Consistency,
    #[serde(default = "default_serial_consistency")]
    pub serial_consistency: Consistency,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Keyword parameters handed to every procedural migration
    #[serde(default)]
    pub procedure_params: ProcedureParams,
}

fn default_durable_writes() -> bool {
    true
}

fn default_migrations_table() -> String {
    "database_migrations".to_string()
}

fn default_migrations_path() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_profiles() -> HashMap<String, KeyspaceProfile> {
    HashMap::from([("dev".to_string(), KeyspaceProfile::simple(1))])
}

fn default_new_migration_name() -> String {
    "v{version}_{description}".to_string()
}

fn default_version_width() -> usize {
    3
}

fn default_consistency() -> Consistency {
    Consistency::All
}

fn default_serial_consistency() -> Consistency {
    Consistency::Serial
}

fn default_request_timeout_seconds() -> u64 {
    120
}

impl MigrationConfig {
    /// Configuration with defaults for everything but the keyspace
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            migrations_table: default_migrations_table(),
            migrations_path: default_migrations_path(),
            profiles: default_profiles(),
            new_migration_name: default_new_migration_name(),
            version_width: default_version_width(),
            gap_policy: GapPolicy::default(),
            consistency: default_consistency(),
            serial_consistency: default_serial_consistency(),
            request_timeout_seconds: default_request_timeout_seconds(),
            procedure_params: ProcedureParams::new(),
        }
    }

    /// Load the configuration from `config/harbormaster.toml`, overridden by env vars.
    ///
    /// Environment variables use the `HARBORMASTER` prefix and `__` as the
    /// nesting separator, e.g. `HARBORMASTER__MIGRATIONS__KEYSPACE=app`.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // If the file exists but is unreadable, warn and retry with env only
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    log::warn!("Failed to load {DEFAULT_CONFIG_FILE}, falling back to env: {err}");
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        Self::from_settings(&settings)
    }

    /// Load the configuration from an explicit file, overridden by env vars
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Self::from_settings(&settings)
    }

    fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        settings.get::<MigrationConfig>("migrations").map_err(|e| {
            ConfigError::Message(format!(
                "Migration configuration could not be loaded from file or environment: {e}"
            ))
        })
    }

    /// Check the values the engine relies on
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (name, value) in [
            ("keyspace", self.keyspace.clone()),
            ("migrations_table", self.migrations_table.clone()),
            ("lock table", self.lock_table()),
        ] {
            if !IDENTIFIER_RE.is_match(&value) {
                return Err(MigrationError::Config(format!(
                    "{name} '{value}' is not a valid CQL identifier"
                )));
            }
        }

        if !self.consistency.is_quorum_or_stronger() {
            return Err(MigrationError::Config(format!(
                "consistency {} is too weak, migrations need QUORUM or stronger",
                self.consistency
            )));
        }
        if !self.serial_consistency.is_serial() {
            return Err(MigrationError::Config(format!(
                "serial_consistency must be SERIAL or LOCAL_SERIAL, got {}",
                self.serial_consistency
            )));
        }
        if self.request_timeout_seconds == 0 {
            return Err(MigrationError::Config(
                "request_timeout_seconds must be greater than zero".to_string(),
            ));
        }

        for (name, profile) in &self.profiles {
            if !profile.replication.contains_key("class") {
                return Err(MigrationError::Config(format!(
                    "profile '{name}' has no replication class"
                )));
            }
        }

        Ok(())
    }

    /// Look up a keyspace profile by name
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if the profile does not exist.
    pub fn profile(&self, name: &str) -> Result<&KeyspaceProfile, MigrationError> {
        self.profiles
            .get(name)
            .ok_or_else(|| MigrationError::Config(format!("Invalid profile name '{name}'")))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn lock_table(&self) -> String {
        format!("{}_lock", self.migrations_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::new("app");
        assert_eq!(config.migrations_table, "database_migrations");
        assert_eq!(config.lock_table(), "database_migrations_lock");
        assert_eq!(config.consistency, Consistency::All);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
        assert!(config.profile("dev").is_ok());
        assert!(config.profile("prod").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MigrationConfig::new("app; DROP KEYSPACE x");
        assert!(matches!(config.validate(), Err(MigrationError::Config(_))));

        config = MigrationConfig::new("app");
        config.consistency = Consistency::One;
        assert!(config.validate().is_err());

        config = MigrationConfig::new("app");
        config.serial_consistency = Consistency::Quorum;
        assert!(config.validate().is_err());

        config = MigrationConfig::new("app");
        config.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lock_table_name_must_fit() {
        let mut config = MigrationConfig::new("app");
        config.migrations_table = "m".repeat(43);
        assert!(config.validate().is_ok());

        // Valid on its own, but `<table>_lock` exceeds 48 characters
        config.migrations_table = "m".repeat(44);
        match config.validate() {
            Err(MigrationError::Config(message)) => assert!(message.contains("lock table")),
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn test_replication_cql() {
        let profile = KeyspaceProfile::simple(3);
        assert_eq!(
            profile.replication_cql(),
            "{'class': 'SimpleStrategy', 'replication_factor': 3}"
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbormaster.toml");
        std::fs::write(
            &path,
            r#"
[migrations]
keyspace = "billing"
migrations_path = "db/migrations"
gap_policy = "allow"
consistency = "local_quorum"
serial_consistency = "local_serial"

[migrations.profiles.prod]
durable_writes = true
replication = { class = "NetworkTopologyStrategy", dc1 = 3 }

[migrations.procedure_params]
batch_size = 500
"#,
        )
        .unwrap();

        let config = MigrationConfig::from_file(&path).unwrap();
        assert_eq!(config.keyspace, "billing");
        assert_eq!(config.migrations_path, PathBuf::from("db/migrations"));
        assert_eq!(config.gap_policy, GapPolicy::Allow);
        assert_eq!(config.consistency, Consistency::LocalQuorum);
        assert_eq!(config.procedure_params["batch_size"], serde_json::json!(500));

        let prod = config.profile("prod").unwrap();
        assert_eq!(
            prod.replication_cql(),
            "{'class': 'NetworkTopologyStrategy', 'dc1': 3}"
        );
        assert!(config.validate().is_ok());
    }
}
