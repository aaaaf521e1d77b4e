//! Checksum calculation for migration definitions

use crate::migration::MigrationError;
use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of migration content
///
/// This is used to detect migrations that were edited after being applied.
/// The digest is taken over the raw bytes, so identical files produce the
/// same checksum on every host.
///
/// # Returns
///
/// Returns the lowercase hexadecimal SHA-256 hash (64 characters)
pub fn calculate_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Validate a stored checksum against the current one
///
/// # Errors
///
/// Returns `MigrationError::ChecksumMismatch` if they differ
pub fn validate_checksum(
    version: i64,
    description: &str,
    stored_checksum: &str,
    current_checksum: &str,
) -> Result<(), MigrationError> {
    if stored_checksum == current_checksum {
        Ok(())
    } else {
        Err(MigrationError::ChecksumMismatch {
            version,
            description: description.to_string(),
            stored: stored_checksum.to_string(),
            current: current_checksum.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let content = b"CREATE TABLE users (id uuid PRIMARY KEY);";
        assert_eq!(calculate_checksum(content), calculate_checksum(content));
        assert_eq!(calculate_checksum(content).len(), 64);
    }

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            calculate_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_byte_change_changes_checksum() {
        let a = calculate_checksum(b"CREATE TABLE users (id int PRIMARY KEY);");
        let b = calculate_checksum(b"CREATE TABLE users (id int PRIMARY KEY) ");
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_checksum() {
        assert!(validate_checksum(1, "init", "abc", "abc").is_ok());
        let err = validate_checksum(1, "init", "abc", "abd").unwrap_err();
        assert!(matches!(err, MigrationError::ChecksumMismatch { version: 1, .. }));
    }
}
