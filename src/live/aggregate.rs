//! Aggregate roll-ups of leaf metrics per owner.

use std::collections::{BTreeSet, HashMap};

use crate::domain::entities::{Aggregate, EntityId, LeafId};

use super::registry::ContainmentIndex;
use super::store::MetricStore;

/// Cache of the last computed aggregate per owner.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    cache: HashMap<EntityId, Aggregate>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the roll-up for `owner` and cache it.
    ///
    /// Returns the aggregate and whether it differs from the cached value.
    /// Owners without any stored metric yield a zero size and no timestamp.
    pub fn recompute(
        &mut self,
        owner: &EntityId,
        index: &ContainmentIndex,
        store: &MetricStore,
    ) -> (Aggregate, bool) {
        let mut aggregate = Aggregate::empty(owner.clone());
        for leaf in index.leaves_of(owner) {
            if let Some(metric) = store.get(leaf) {
                aggregate.total_size = aggregate.total_size.saturating_add(metric.size);
                aggregate.last_event = aggregate.last_event.max(metric.last_modified_at);
            }
        }

        let changed = self.cache.get(owner) != Some(&aggregate);
        if changed {
            self.cache.insert(owner.clone(), aggregate.clone());
        }
        (aggregate, changed)
    }

    pub fn get(&self, owner: &EntityId) -> Option<&Aggregate> {
        self.cache.get(owner)
    }

    pub fn forget(&mut self, owner: &EntityId) {
        self.cache.remove(owner);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Every owner whose roll-up depends on one of `leaves`.
pub fn affected_owners<'a>(
    leaves: impl IntoIterator<Item = &'a LeafId>,
    index: &ContainmentIndex,
) -> BTreeSet<EntityId> {
    leaves
        .into_iter()
        .flat_map(|leaf| index.owners_of(leaf).cloned())
        .collect()
}
