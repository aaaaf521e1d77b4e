//! Span constructors for the optional `tracing` feature
//!
//! Callers enter the returned span for the duration of the operation:
//!
//! ```ignore
//! let _span = tracing_helpers::store_operation_span("acquire_lock").entered();
//! ```

use tracing::Span;

/// Span around a single state-store statement
pub(crate) fn store_operation_span(operation: &str) -> Span {
    tracing::info_span!("harbormaster.store", operation = operation)
}

/// Span around the execution of one migration
pub(crate) fn migration_span(version: i64, description: &str, kind: &str) -> Span {
    tracing::info_span!(
        "harbormaster.migration",
        version = version,
        description = description,
        kind = kind
    )
}

/// Span around a whole orchestrated command (`migrate`, `baseline`, ...)
pub(crate) fn command_span(command: &str, keyspace: &str) -> Span {
    tracing::info_span!("harbormaster.command", command = command, keyspace = keyspace)
}
