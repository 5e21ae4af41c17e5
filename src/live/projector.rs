//! Projection of the maintained order into display rows.

use std::collections::HashSet;

use time::OffsetDateTime;

use crate::domain::entities::EntityId;
use crate::domain::types::WorkloadKind;

use super::aggregate::Aggregator;
use super::registry::{EntityRegistry, ViewFilter};

/// One rendered line of the live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: EntityId,
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    pub created_at: Option<OffsetDateTime>,
    pub total_size: u64,
    pub last_event: Option<OffsetDateTime>,
    /// Touched by the most recent flush. Reported once, then cleared.
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct ViewProjector {
    changed: HashSet<EntityId>,
}

impl ViewProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_changed(&mut self, id: EntityId) {
        self.changed.insert(id);
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    /// Project `order` into rows and clear the change flags.
    ///
    /// Ids that are unknown to the registry or no longer pass `filter` are
    /// skipped. At most `limit` rows are returned when set.
    pub fn project(
        &mut self,
        order: &[EntityId],
        aggregator: &Aggregator,
        registry: &EntityRegistry,
        filter: &ViewFilter,
        limit: Option<usize>,
    ) -> Vec<Row> {
        let limit = limit.unwrap_or(usize::MAX);
        let rows = order
            .iter()
            .filter_map(|id| registry.get(id))
            .filter(|entity| filter.matches(entity))
            .take(limit)
            .map(|entity| {
                let (total_size, last_event) = aggregator
                    .get(&entity.id)
                    .map(|aggregate| (aggregate.total_size, aggregate.last_event))
                    .unwrap_or((0, None));
                Row {
                    id: entity.id.clone(),
                    kind: entity.kind,
                    namespace: entity.namespace.clone(),
                    name: entity.name.clone(),
                    created_at: entity.created_at,
                    total_size,
                    last_event,
                    changed: self.changed.contains(&entity.id),
                }
            })
            .collect();
        self.changed.clear();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Metric;
    use crate::live::registry::{build, tests::entity};
    use crate::live::store::MetricStore;

    #[test]
    fn changed_flag_is_edge_triggered() {
        let (registry, index) = build([
            entity("a", WorkloadKind::Pod, &[], &["c1"]),
            entity("b", WorkloadKind::Pod, &[], &[]),
        ]);
        let mut store = MetricStore::new();
        store.upsert("c1".into(), Metric::new(7, None));
        let mut aggregator = Aggregator::new();
        aggregator.recompute(&"a".into(), &index, &store);

        let mut projector = ViewProjector::new();
        projector.mark_changed("a".into());
        let order = vec![EntityId::from("a"), EntityId::from("b")];
        let filter = ViewFilter::default();

        let first = projector.project(&order, &aggregator, &registry, &filter, None);
        assert_eq!(first.len(), 2);
        assert!(first[0].changed);
        assert_eq!(first[0].total_size, 7);
        assert!(!first[1].changed);

        let second = projector.project(&order, &aggregator, &registry, &filter, None);
        assert!(second.iter().all(|row| !row.changed));
    }

    #[test]
    fn unknown_ids_are_skipped_and_limit_applies() {
        let (registry, _) = build([
            entity("a", WorkloadKind::Pod, &[], &[]),
            entity("b", WorkloadKind::Pod, &[], &[]),
        ]);
        let aggregator = Aggregator::new();
        let mut projector = ViewProjector::new();
        let order = vec![
            EntityId::from("ghost"),
            EntityId::from("a"),
            EntityId::from("b"),
        ];

        let rows = projector.project(&order, &aggregator, &registry, &ViewFilter::default(), Some(1));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, EntityId::from("a"));
    }
}
