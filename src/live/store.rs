//! Per-leaf metric store.
//!
//! Holds the latest known log-file metadata for every leaf that has reported.

use std::collections::HashMap;

use crate::domain::entities::{LeafId, Metric};

/// Latest metric per leaf id.
#[derive(Debug, Clone, Default)]
pub struct MetricStore {
    metrics: HashMap<LeafId, Metric>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the initial bulk snapshot, merging duplicates in arrival order.
    pub fn seed(&mut self, metrics: impl IntoIterator<Item = (LeafId, Metric)>) {
        for (leaf, metric) in metrics {
            self.upsert(leaf, metric);
        }
    }

    /// Record an observation for `leaf`.
    ///
    /// The size is always overwritten. The timestamp is the maximum of the
    /// stored and incoming values, so a stale or missing timestamp never moves
    /// it back. Returns true when the stored metric actually changed.
    pub fn upsert(&mut self, leaf: LeafId, metric: Metric) -> bool {
        match self.metrics.get_mut(&leaf) {
            Some(stored) => {
                let merged = stored.merged_with(metric);
                if merged == *stored {
                    return false;
                }
                *stored = merged;
                true
            }
            None => {
                self.metrics.insert(leaf, metric);
                true
            }
        }
    }

    /// Drop the metric for `leaf`. Returns true if one was stored.
    pub fn remove(&mut self, leaf: &LeafId) -> bool {
        self.metrics.remove(leaf).is_some()
    }

    pub fn get(&self, leaf: &LeafId) -> Option<&Metric> {
        self.metrics.get(leaf)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn clear(&mut self) {
        self.metrics.clear();
    }
}
