//! Migration file identity and definitions

use crate::migration::checksum::calculate_checksum;
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Extension of statement-script migrations
pub const STATEMENT_EXTENSION: &str = "cql";

/// Extension of procedural migrations
pub const PROCEDURAL_EXTENSION: &str = "rs";

// Pattern: optional `v`, digits, underscore, description, extension
static FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v?(\d+)_([A-Za-z0-9][A-Za-z0-9_\-]*)\.([A-Za-z0-9]+)$")
        .expect("migration file name pattern is valid")
});

/// How a migration is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    /// A script of `;`-separated CQL statements
    Statement,
    /// Code exposing one entry point that receives the live session
    Procedural,
}

impl MigrationKind {
    /// Kind selected by a file extension, `None` for unrecognized extensions
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            STATEMENT_EXTENSION => Some(MigrationKind::Statement),
            PROCEDURAL_EXTENSION => Some(MigrationKind::Procedural),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MigrationKind::Statement => STATEMENT_EXTENSION,
            MigrationKind::Procedural => PROCEDURAL_EXTENSION,
        }
    }

    /// Representation persisted in the state table
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Statement => "STATEMENT",
            MigrationKind::Procedural => "PROCEDURAL",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATEMENT" => Ok(MigrationKind::Statement),
            "PROCEDURAL" => Ok(MigrationKind::Procedural),
            other => Err(format!("unknown migration kind '{other}'")),
        }
    }
}

/// Identity parsed from a migration file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationIdentity {
    pub version: i64,
    pub description: String,
    pub kind: MigrationKind,
}

/// Parse a migration file name to extract version, description and kind
///
/// Expected format: `[v]<version>_<description>.<cql|rs>`
///
/// # Example
/// - `v001_create_users_table.cql` → version: 1, description: "create_users_table", kind: Statement
/// - `3_backfill_emails.rs` → version: 3, description: "backfill_emails", kind: Procedural
///
/// # Errors
///
/// Returns `MigrationError::MalformedName` if the name does not match the
/// pattern, the version is not a positive integer, or the extension is not
/// recognized.
pub fn parse_identity(filename: &str) -> Result<MigrationIdentity, MigrationError> {
    let malformed = |reason: String| MigrationError::MalformedName {
        name: filename.to_string(),
        reason,
    };

    let caps = FILE_NAME_RE.captures(filename).ok_or_else(|| {
        malformed("expected pattern [v]<version>_<description>.<ext>".to_string())
    })?;

    let version_str = &caps[1];
    let version = version_str
        .parse::<i64>()
        .map_err(|e| malformed(format!("invalid version '{version_str}': {e}")))?;
    if version <= 0 {
        return Err(malformed("version must be a positive integer".to_string()));
    }

    let extension = &caps[3];
    let kind = MigrationKind::from_extension(extension).ok_or_else(|| {
        malformed(format!(
            "unrecognized extension '.{extension}', expected .{STATEMENT_EXTENSION} or .{PROCEDURAL_EXTENSION}"
        ))
    })?;

    Ok(MigrationIdentity {
        version,
        description: caps[2].to_string(),
        kind,
    })
}

/// A migration discovered on disk
///
/// Immutable once loaded; re-derived from the file system on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    /// Migration version (positive, unique within the catalog)
    pub version: i64,

    /// Description derived from the file name
    pub description: String,

    pub kind: MigrationKind,

    /// Path to the migration file
    pub path: PathBuf,

    /// Raw file content
    pub content: String,

    /// SHA-256 checksum of `content`
    pub checksum: String,
}

impl MigrationDefinition {
    /// Build a definition from its identity and content, computing the checksum
    pub fn new(identity: MigrationIdentity, path: PathBuf, content: String) -> Self {
        let checksum = calculate_checksum(content.as_bytes());
        Self {
            version: identity.version,
            description: identity.description,
            kind: identity.kind,
            path,
            content,
            checksum,
        }
    }

    /// Read and identify a single migration file
    ///
    /// # Errors
    ///
    /// Returns `MalformedName` for a bad file name and `Io` if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self, MigrationError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrationError::MalformedName {
                name: path.display().to_string(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let identity = parse_identity(filename)?;
        let content = std::fs::read_to_string(path).map_err(|e| MigrationError::io(path, e))?;

        Ok(Self::new(identity, path.to_path_buf(), content))
    }
}

impl fmt::Display for MigrationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{} ({})", self.version, self.description, self.kind)
    }
}
