//! Incrementally maintained row order.
//!
//! The order is fully sorted only by [`OrderMaintainer::init`] and when the
//! sort key changes. Every flush afterwards repositions just the rows whose
//! sort inputs changed.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use time::OffsetDateTime;

use crate::domain::entities::EntityId;
use crate::domain::types::{SortDirection, SortField, SortKey};

/// Sort inputs of one visible row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub id: EntityId,
    pub name: String,
    pub namespace: String,
    pub created_at: Option<OffsetDateTime>,
    pub total_size: u64,
    pub last_event: Option<OffsetDateTime>,
}

/// Total order over rows under `key`.
///
/// Every key ends with the entity id, so two distinct rows never compare equal.
pub fn compare(key: SortKey, a: &RowKey, b: &RowKey) -> Ordering {
    match key {
        SortKey::Recency => b
            .last_event
            .cmp(&a.last_event)
            .then_with(|| b.total_size.cmp(&a.total_size))
            .then_with(|| a.id.cmp(&b.id)),
        SortKey::Field { field, direction } => {
            let primary = match field {
                SortField::Name => a.name.cmp(&b.name),
                SortField::Namespace => a.namespace.cmp(&b.namespace),
                SortField::Created => a.created_at.cmp(&b.created_at),
                SortField::Size => a.total_size.cmp(&b.total_size),
                SortField::LastEvent => a.last_event.cmp(&b.last_event),
            };
            let primary = match direction {
                SortDirection::Asc => primary,
                SortDirection::Desc => primary.reverse(),
            };
            let by_name = if field == SortField::Name {
                Ordering::Equal
            } else {
                a.name.cmp(&b.name)
            };
            primary.then(by_name).then_with(|| a.id.cmp(&b.id))
        }
    }
}

/// Sorted list of visible entity ids plus the inputs it was sorted on.
#[derive(Debug, Clone, Default)]
pub struct OrderMaintainer {
    key: SortKey,
    ids: Vec<EntityId>,
    rows: HashMap<EntityId, RowKey>,
}

impl OrderMaintainer {
    pub fn new(key: SortKey) -> Self {
        Self {
            key,
            ids: Vec::new(),
            rows: HashMap::new(),
        }
    }

    /// Replace the whole order with `entries`, fully sorted.
    pub fn init(&mut self, entries: impl IntoIterator<Item = RowKey>) -> &[EntityId] {
        self.rows = entries
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();
        self.ids = self.rows.keys().cloned().collect();
        self.resort();
        &self.ids
    }

    /// Apply one flush worth of changes.
    ///
    /// `removed` ids leave the order. Each distinct `changed` row (the last
    /// value wins) is taken out of its current slot and binary-search
    /// inserted under the active key; rows not yet present are added. An id
    /// present in both inputs is removed.
    pub fn apply_changes(
        &mut self,
        changed: impl IntoIterator<Item = RowKey>,
        removed: impl IntoIterator<Item = EntityId>,
    ) -> &[EntityId] {
        let removed: HashSet<EntityId> = removed.into_iter().collect();
        let mut pending: HashMap<EntityId, RowKey> = HashMap::new();
        for row in changed {
            if !removed.contains(&row.id) {
                pending.insert(row.id.clone(), row);
            }
        }

        if removed.is_empty() && pending.is_empty() {
            return &self.ids;
        }

        self.ids
            .retain(|id| !removed.contains(id) && !pending.contains_key(id));
        for id in &removed {
            self.rows.remove(id);
        }

        let key = self.key;
        for (id, row) in pending {
            let rows = &self.rows;
            let slot = self.ids.partition_point(|probe| {
                rows.get(probe)
                    .is_some_and(|existing| compare(key, existing, &row) == Ordering::Less)
            });
            self.ids.insert(slot, id.clone());
            self.rows.insert(id, row);
        }

        &self.ids
    }

    /// Switch the active key, re-sorting when it differs.
    pub fn set_sort_key(&mut self, key: SortKey) -> &[EntityId] {
        if self.key != key {
            self.key = key;
            self.resort();
        }
        &self.ids
    }

    pub fn key(&self) -> SortKey {
        self.key
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn row(&self, id: &EntityId) -> Option<&RowKey> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn resort(&mut self) {
        let key = self.key;
        let rows = &self.rows;
        self.ids.sort_by(|a, b| match (rows.get(a), rows.get(b)) {
            (Some(a), Some(b)) => compare(key, a, b),
            _ => a.cmp(b),
        });
    }
}
