//! Metrics module for monitoring providers.
//!
//! Each provider owns a [`ProviderMetrics`] recording:
//! - operations and failures by operation name and error kind
//! - payload bytes moved on the eager and bulk paths
//! - region and target migrations
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = provider.metrics();
//! println!("bulk bytes: {}", snapshot.bulk_bytes);
//! ```

mod counters;

pub use counters::{Counter, LabeledCounter};

use crate::error::ErrorKind;
use crate::transfer::TransferPath;
use std::collections::HashMap;

/// Live counters for one provider.
#[derive(Debug)]
pub struct ProviderMetrics {
    /// Operations handled, by operation name.
    pub operations: LabeledCounter,
    /// Failed operations, by operation name.
    pub failures: LabeledCounter,
    /// Failed operations, by error kind.
    pub errors: LabeledCounter,
    /// Payload bytes carried inline.
    pub eager_bytes: Counter,
    /// Payload bytes moved through bulk buffers.
    pub bulk_bytes: Counter,
    /// Completed region migrations.
    pub region_migrations: Counter,
    /// Completed target migrations.
    pub target_migrations: Counter,
    /// Migrations that failed before completing.
    pub migration_failures: Counter,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            operations: LabeledCounter::new("provider_operations_total", "op"),
            failures: LabeledCounter::new("provider_failures_total", "op"),
            errors: LabeledCounter::new("provider_errors_total", "kind"),
            eager_bytes: Counter::new("provider_eager_bytes_total"),
            bulk_bytes: Counter::new("provider_bulk_bytes_total"),
            region_migrations: Counter::new("provider_region_migrations_total"),
            target_migrations: Counter::new("provider_target_migrations_total"),
            migration_failures: Counter::new("provider_migration_failures_total"),
        }
    }

    /// Record the outcome of one operation.
    pub fn record_operation(&self, op: &'static str, error: Option<ErrorKind>) {
        self.operations.inc(op);
        if let Some(kind) = error {
            self.failures.inc(op);
            self.errors.inc(kind_label(kind));
        }
    }

    /// Record payload bytes moved on a path.
    pub fn record_transfer(&self, path: TransferPath, bytes: u64) {
        match path {
            TransferPath::Eager => self.eager_bytes.inc_by(bytes),
            TransferPath::Bulk => self.bulk_bytes.inc_by(bytes),
        }
    }

    /// Take a point-in-time copy of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self.operations.to_map(),
            failures: self.failures.to_map(),
            errors: self.errors.to_map(),
            eager_bytes: self.eager_bytes.get(),
            bulk_bytes: self.bulk_bytes.get(),
            region_migrations: self.region_migrations.get(),
            target_migrations: self.target_migrations.get(),
            migration_failures: self.migration_failures.get(),
        }
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "not_found",
        ErrorKind::AlreadyExists => "already_exists",
        ErrorKind::OutOfSpace => "out_of_space",
        ErrorKind::OutOfBounds => "out_of_bounds",
        ErrorKind::MalformedIdentifier => "malformed_identifier",
        ErrorKind::InvalidFormat => "invalid_format",
        ErrorKind::Unsupported => "unsupported",
        ErrorKind::IoFailure => "io_failure",
        ErrorKind::MigrationFailed => "migration_failed",
        ErrorKind::ConnectionFailure => "connection_failure",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Internal => "internal",
    }
}

/// Point-in-time provider metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations: HashMap<&'static str, u64>,
    pub failures: HashMap<&'static str, u64>,
    pub errors: HashMap<&'static str, u64>,
    pub eager_bytes: u64,
    pub bulk_bytes: u64,
    pub region_migrations: u64,
    pub target_migrations: u64,
    pub migration_failures: u64,
}

impl MetricsSnapshot {
    /// Operations handled with the given name.
    pub fn operation_count(&self, op: &str) -> u64 {
        self.operations.get(op).copied().unwrap_or(0)
    }

    /// Total failed operations.
    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}
