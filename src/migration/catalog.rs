//! Migration catalog - discovery, validation and generation of migration files

use crate::migration::file::{MigrationDefinition, MigrationKind};
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

static SLUG_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));

/// What to do when catalog versions are not contiguous
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Fail with `MigrationError::Sequence` (e.g. files numbered 1, 2, 5)
    #[default]
    Reject,
    /// Accept gaps as intentional skips
    Allow,
}

/// Ordered set of migrations discovered in a directory
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    migrations: Vec<MigrationDefinition>,
}

impl Catalog {
    /// Discover all migration files in a directory
    ///
    /// Scans the directory for `.cql` and `.rs` files, parses their identity,
    /// computes checksums, and returns them sorted by version (ascending).
    /// Hidden files and files with other extensions are ignored. The file
    /// system is never modified, so loading is always safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns errors if:
    /// - The directory doesn't exist or can't be read
    /// - A migration file has an invalid name
    /// - Two files share a version
    /// - Versions have gaps and `gap_policy` is `Reject`
    pub fn load(directory: &Path, gap_policy: GapPolicy) -> Result<Self, MigrationError> {
        if !directory.is_dir() {
            return Err(MigrationError::io(
                directory,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "migrations directory does not exist or is not a directory",
                ),
            ));
        }

        let entries = fs::read_dir(directory).map_err(|e| MigrationError::io(directory, e))?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| MigrationError::io(directory, e))?.path();

            if !path.is_file() || !is_candidate(&path) {
                continue;
            }

            migrations.push(MigrationDefinition::from_path(&path)?);
        }

        Self::from_definitions(migrations, gap_policy)
    }

    /// Build a catalog from already-loaded definitions, applying the same
    /// ordering and integrity checks as [`Catalog::load`]
    ///
    /// # Errors
    ///
    /// Returns `DuplicateVersion` or `Sequence` (under `GapPolicy::Reject`).
    pub fn from_definitions(
        mut migrations: Vec<MigrationDefinition>,
        gap_policy: GapPolicy,
    ) -> Result<Self, MigrationError> {
        migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));

        for pair in migrations.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            if previous.version == current.version {
                return Err(MigrationError::DuplicateVersion {
                    version: current.version,
                    first: previous.path.clone(),
                    second: current.path.clone(),
                });
            }
            if gap_policy == GapPolicy::Reject && current.version != previous.version + 1 {
                return Err(MigrationError::Sequence {
                    previous: previous.version,
                    found: current.version,
                });
            }
        }

        log::debug!("Loaded {} migration(s)", migrations.len());
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[MigrationDefinition] {
        &self.migrations
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn get(&self, version: i64) -> Option<&MigrationDefinition> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
    }

    /// Highest version in the catalog
    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }

    /// Resolve a target given by the user: either a version number or the
    /// description of an existing migration
    ///
    /// # Errors
    ///
    /// Returns `InvalidTarget` if `target` is neither a positive catalog
    /// version nor a known description.
    pub fn resolve_target(&self, target: &str) -> Result<i64, MigrationError> {
        let invalid = || MigrationError::InvalidTarget(target.to_string());

        if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
            let version = target.parse::<i64>().map_err(|_| invalid())?;
            return self.get(version).map(|m| m.version).ok_or_else(invalid);
        }

        self.migrations
            .iter()
            .find(|m| m.description == target)
            .map(|m| m.version)
            .ok_or_else(invalid)
    }

    /// Create a new, empty migration file with the next version
    ///
    /// The file name is rendered from `template`, which may use `{version}`
    /// (zero-padded to `version_width` digits) and `{description}`. The
    /// description is reduced to a lowercase slug first.
    ///
    /// # Errors
    ///
    /// Returns `MalformedName` if the description has no usable characters or
    /// the rendered name does not parse back, and `Io` if the file already
    /// exists or cannot be written.
    pub fn generate(
        &self,
        directory: &Path,
        template: &str,
        version_width: usize,
        description: &str,
        kind: MigrationKind,
    ) -> Result<PathBuf, MigrationError> {
        let slug = slugify(description);
        if slug.is_empty() {
            return Err(MigrationError::MalformedName {
                name: description.to_string(),
                reason: "description must contain at least one letter or digit".to_string(),
            });
        }

        let next_version = self.latest_version().unwrap_or(0) + 1;
        let stem = template
            .replace("{version}", &format!("{next_version:0version_width$}"))
            .replace("{description}", &slug);
        let filename = format!("{stem}.{}", kind.extension());

        // The rendered name must be discoverable by `load`
        let identity = crate::migration::file::parse_identity(&filename)?;
        if identity.version != next_version {
            return Err(MigrationError::MalformedName {
                name: filename,
                reason: format!("template does not render version {next_version}"),
            });
        }

        fs::create_dir_all(directory).map_err(|e| MigrationError::io(directory, e))?;
        let path = directory.join(&filename);
        let header = match kind {
            MigrationKind::Statement => format!("-- {next_version}: {description}\n"),
            MigrationKind::Procedural => format!("//! {next_version}: {description}\n"),
        };

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, header.as_bytes()))
            .map_err(|e| MigrationError::io(&path, e))?;

        log::info!("Created migration file {}", path.display());
        Ok(path)
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a MigrationDefinition;
    type IntoIter = std::slice::Iter<'a, MigrationDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.iter()
    }
}

fn is_candidate(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));

    !hidden
        && path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(MigrationKind::from_extension)
            .is_some()
}

fn slugify(description: &str) -> String {
    SLUG_SEPARATOR_RE
        .replace_all(&description.to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}
