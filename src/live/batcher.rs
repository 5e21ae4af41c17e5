//! Event batching between flushes.
//!
//! Inbound events are coalesced per id while keeping the per-id order. The
//! net effect of any sequence on one id is "was it deleted at some point" plus
//! "what is the final upsert after the last delete", which the flush applies
//! as deletes first, then upserts.

use std::collections::BTreeMap;

use metrics::gauge;
use tracing::debug;

use crate::domain::entities::{Entity, EntityId, LeafId, Metric};

const METRIC_PENDING_EVENTS: &str = "tailview_pending_events";

/// One inbound change from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Log-file metadata added or modified.
    MetricUpsert { leaf: LeafId, metric: Metric },
    /// Log-file metadata removed.
    MetricDelete { leaf: LeafId },
    /// Workload added or modified.
    EntityUpsert(Entity),
    /// Workload deleted.
    EntityDelete(EntityId),
}

/// Coalesced effect of every event seen for one id in a window.
#[derive(Debug, Clone, PartialEq)]
pub struct NetEffect<T> {
    /// A delete arrived; it must be applied before `upsert`.
    pub deleted_first: bool,
    /// Final value after the last delete, if any.
    pub upsert: Option<T>,
}

impl<T> Default for NetEffect<T> {
    fn default() -> Self {
        Self {
            deleted_first: false,
            upsert: None,
        }
    }
}

impl<T> NetEffect<T> {
    fn delete(&mut self) {
        self.deleted_first = true;
        self.upsert = None;
    }
}

/// Everything pending for one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub entities: BTreeMap<EntityId, NetEffect<Entity>>,
    pub metrics: BTreeMap<LeafId, NetEffect<Metric>>,
    /// Raw events folded into this batch.
    pub event_count: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Leaves whose stored metric must be removed before upserts run.
    pub fn metric_deletes(&self) -> impl Iterator<Item = &LeafId> {
        self.metrics
            .iter()
            .filter(|(_, effect)| effect.deleted_first)
            .map(|(leaf, _)| leaf)
    }

    pub fn metric_upserts(&self) -> impl Iterator<Item = (&LeafId, &Metric)> {
        self.metrics
            .iter()
            .filter_map(|(leaf, effect)| effect.upsert.as_ref().map(|metric| (leaf, metric)))
    }
}

/// Accumulates events until the next flush takes them.
#[derive(Debug, Default)]
pub struct EventBatcher {
    pending: Batch,
}

impl EventBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the pending window.
    pub fn push(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::MetricUpsert { leaf, metric } => {
                let effect = self.pending.metrics.entry(leaf).or_default();
                effect.upsert = Some(match effect.upsert {
                    Some(previous) => previous.merged_with(metric),
                    None => metric,
                });
            }
            LiveEvent::MetricDelete { leaf } => {
                self.pending.metrics.entry(leaf).or_default().delete();
            }
            LiveEvent::EntityUpsert(entity) => {
                let effect = self.pending.entities.entry(entity.id.clone()).or_default();
                effect.upsert = Some(entity);
            }
            LiveEvent::EntityDelete(id) => {
                self.pending.entities.entry(id).or_default().delete();
            }
        }
        self.pending.event_count += 1;
        gauge!(METRIC_PENDING_EVENTS).set(self.pending.event_count as f64);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = LiveEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Take the pending window, or `None` when nothing arrived since the last take.
    pub fn take(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        gauge!(METRIC_PENDING_EVENTS).set(0.0);
        Some(std::mem::take(&mut self.pending))
    }

    /// Drop everything pending. Returns the number of discarded events.
    pub fn discard(&mut self) -> usize {
        let discarded = self.pending.event_count;
        if discarded > 0 {
            debug!(discarded, "Discarded pending live events");
            gauge!(METRIC_PENDING_EVENTS).set(0.0);
        }
        self.pending = Batch::default();
        discarded
    }

    pub fn pending_events(&self) -> usize {
        self.pending.event_count
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
