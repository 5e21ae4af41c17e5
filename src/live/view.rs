//! Committed live-view state and the flush that advances it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::entities::{Entity, EntityId, LeafId, Metric};
use crate::domain::types::SortKey;

use super::aggregate::{Aggregator, affected_owners};
use super::batcher::Batch;
use super::order::{OrderMaintainer, RowKey};
use super::projector::{Row, ViewProjector};
use super::registry::{ContainmentIndex, EntityRegistry, ViewFilter};
use super::store::MetricStore;
use super::worker::SortWorkerHandle;

const METRIC_FLUSH_TOTAL: &str = "tailview_flush_total";
const METRIC_FLUSH_MS: &str = "tailview_flush_ms";

/// Where the maintained order lives.
#[derive(Debug)]
pub enum OrderBackend {
    Inline(OrderMaintainer),
    Offloaded(SortWorkerHandle),
}

impl OrderBackend {
    fn init(&mut self, rows: Vec<RowKey>) {
        match self {
            OrderBackend::Inline(order) => {
                order.init(rows);
            }
            OrderBackend::Offloaded(worker) => worker.init(rows),
        }
    }

    fn apply(&mut self, changed: Vec<RowKey>, removed: Vec<EntityId>) {
        match self {
            OrderBackend::Inline(order) => {
                order.apply_changes(changed, removed);
            }
            OrderBackend::Offloaded(worker) => worker.apply(changed, removed),
        }
    }

    fn set_sort_key(&mut self, key: SortKey) {
        match self {
            OrderBackend::Inline(order) => {
                order.set_sort_key(key);
            }
            OrderBackend::Offloaded(worker) => worker.set_sort_key(key),
        }
    }

    fn ids(&self) -> Vec<EntityId> {
        match self {
            OrderBackend::Inline(order) => order.ids().to_vec(),
            OrderBackend::Offloaded(worker) => worker.latest().to_vec(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub events: usize,
    pub entities_changed: usize,
    pub leaves_changed: usize,
    pub owners_recomputed: usize,
    pub rows_changed: usize,
    pub rows_removed: usize,
}

/// State owned by one session: registry, index, metrics, aggregates and order.
#[derive(Debug)]
pub struct LiveView {
    registry: EntityRegistry,
    index: ContainmentIndex,
    store: MetricStore,
    aggregator: Aggregator,
    order: OrderBackend,
    members: HashSet<EntityId>,
    projector: ViewProjector,
    filter: ViewFilter,
    sort_key: SortKey,
    row_limit: Option<usize>,
}

impl LiveView {
    /// View that keeps its order on the calling task.
    pub fn new(filter: ViewFilter, sort_key: SortKey) -> Self {
        Self::with_backend(filter, sort_key, OrderBackend::Inline(OrderMaintainer::new(sort_key)))
    }

    /// View whose order is maintained by a background sort worker.
    pub fn offloaded(filter: ViewFilter, sort_key: SortKey) -> Self {
        Self::with_backend(
            filter,
            sort_key,
            OrderBackend::Offloaded(SortWorkerHandle::spawn(sort_key)),
        )
    }

    fn with_backend(filter: ViewFilter, sort_key: SortKey, order: OrderBackend) -> Self {
        Self {
            registry: EntityRegistry::new(),
            index: ContainmentIndex::default(),
            store: MetricStore::new(),
            aggregator: Aggregator::new(),
            order,
            members: HashSet::new(),
            projector: ViewProjector::new(),
            filter,
            sort_key,
            row_limit: None,
        }
    }

    pub fn with_row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// Replace all committed state with a freshly fetched snapshot.
    pub fn load(
        &mut self,
        entities: impl IntoIterator<Item = Entity>,
        metrics: impl IntoIterator<Item = (LeafId, Metric)>,
    ) {
        self.registry = EntityRegistry::from_entities(entities);
        self.index = ContainmentIndex::build(&self.registry);
        self.store.clear();
        self.store.seed(metrics);
        self.rebuild_order();
        info!(
            entities = self.registry.len(),
            leaves = self.store.len(),
            visible = self.members.len(),
            "Live view loaded"
        );
    }

    /// Apply one batch: entity changes, metric deletes, metric upserts, then
    /// aggregate recompute and order maintenance for the affected owners.
    pub fn apply(&mut self, batch: Batch) -> FlushReport {
        let started_at = Instant::now();
        let mut report = FlushReport {
            events: batch.event_count,
            ..FlushReport::default()
        };

        let mut touched: BTreeSet<EntityId> = BTreeSet::new();
        let mut registry_changed = false;
        for (id, effect) in batch.entities.iter() {
            let mut changed = false;
            if effect.deleted_first {
                changed |= self.registry.mark_deleted(id);
            }
            if let Some(entity) = &effect.upsert {
                changed |= self.registry.upsert(entity.clone());
            }
            if changed {
                touched.insert(id.clone());
                registry_changed = true;
            }
        }
        report.entities_changed = touched.len();

        if registry_changed {
            let rebuilt = ContainmentIndex::build(&self.registry);
            touched.extend(rebuilt.changed_owners(&self.index));
            self.index = rebuilt;
        }

        let mut changed_leaves: Vec<&LeafId> = Vec::new();
        for leaf in batch.metric_deletes() {
            if self.store.remove(leaf) {
                changed_leaves.push(leaf);
            }
        }
        for (leaf, metric) in batch.metric_upserts() {
            if self.store.upsert(leaf.clone(), *metric) {
                changed_leaves.push(leaf);
            }
        }
        report.leaves_changed = changed_leaves.len();

        let mut owners = affected_owners(changed_leaves, &self.index);
        owners.extend(touched.iter().cloned());

        let mut changed_rows = Vec::new();
        let mut removed = Vec::new();
        for owner in owners {
            if !self.registry.is_visible(&owner, &self.filter) {
                if self.members.remove(&owner) {
                    removed.push(owner.clone());
                }
                self.aggregator.forget(&owner);
                continue;
            }

            let (_, aggregate_changed) =
                self.aggregator.recompute(&owner, &self.index, &self.store);
            report.owners_recomputed += 1;
            let newly_visible = self.members.insert(owner.clone());
            if aggregate_changed || newly_visible || touched.contains(&owner) {
                if let Some(row) = self.row_key(&owner) {
                    changed_rows.push(row);
                }
                self.projector.mark_changed(owner);
            }
        }
        report.rows_changed = changed_rows.len();
        report.rows_removed = removed.len();

        if !changed_rows.is_empty() || !removed.is_empty() {
            self.order.apply(changed_rows, removed);
        }

        counter!(METRIC_FLUSH_TOTAL).increment(1);
        histogram!(METRIC_FLUSH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            events = report.events,
            entities_changed = report.entities_changed,
            leaves_changed = report.leaves_changed,
            rows_changed = report.rows_changed,
            rows_removed = report.rows_removed,
            "Live view flushed"
        );

        report
    }

    /// Change the visible subset; the order is rebuilt from scratch.
    pub fn set_filter(&mut self, filter: ViewFilter) {
        if self.filter == filter {
            return;
        }
        self.filter = filter;
        self.rebuild_order();
    }

    pub fn set_sort_key(&mut self, key: SortKey) {
        if self.sort_key == key {
            return;
        }
        self.sort_key = key;
        self.order.set_sort_key(key);
    }

    /// Project the current order into rows, consuming the change flags.
    pub fn rows(&mut self) -> Vec<Row> {
        let ids = self.order.ids();
        self.projector.project(
            &ids,
            &self.aggregator,
            &self.registry,
            &self.filter,
            self.row_limit,
        )
    }

    pub fn filter(&self) -> &ViewFilter {
        &self.filter
    }

    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    /// Number of rows in the maintained order.
    pub fn visible_len(&self) -> usize {
        self.members.len()
    }

    /// Notified whenever the background sort worker publishes a new order.
    /// `None` when the order is maintained inline.
    pub fn order_updates(&self) -> Option<watch::Receiver<Arc<[EntityId]>>> {
        match &self.order {
            OrderBackend::Inline(_) => None,
            OrderBackend::Offloaded(worker) => Some(worker.subscribe()),
        }
    }

    fn rebuild_order(&mut self) {
        self.aggregator.clear();
        self.projector.clear_changed();
        self.members.clear();

        let visible = self.registry.visible_ids(&self.filter);
        let mut rows = Vec::with_capacity(visible.len());
        for id in visible {
            self.aggregator.recompute(&id, &self.index, &self.store);
            if let Some(row) = self.row_key(&id) {
                rows.push(row);
            }
            self.members.insert(id);
        }
        self.order.init(rows);
    }

    fn row_key(&self, id: &EntityId) -> Option<RowKey> {
        let entity = self.registry.get(id)?;
        let (total_size, last_event) = self
            .aggregator
            .get(id)
            .map(|aggregate| (aggregate.total_size, aggregate.last_event))
            .unwrap_or((0, None));
        Some(RowKey {
            id: entity.id.clone(),
            name: entity.name.clone(),
            namespace: entity.namespace.clone(),
            created_at: entity.created_at,
            total_size,
            last_event,
        })
    }
}
