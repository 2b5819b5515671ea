//! Monotonic counters, plain and keyed by a static label.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single monotonic count.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Exported metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counts split by one label, e.g. operation name or error kind.
///
/// Label values are `&'static str` so recording never allocates after the
/// first hit of a value.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    label: &'static str,
    values: DashMap<&'static str, AtomicU64>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            values: DashMap::new(),
        }
    }

    /// Exported metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name of the label dimension.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn inc(&self, value: &'static str) {
        if let Some(count) = self.values.get(value) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(value)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count for one label value; zero if never recorded.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Copy of every recorded label value and its count.
    pub fn to_map(&self) -> HashMap<&'static str, u64> {
        self.values
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
