//! Entity registry and the ownership containment index built from it.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::domain::entities::{Entity, EntityId, LeafId};
use crate::domain::types::WorkloadKind;

/// Longest ownership chain followed before the walk gives up on a branch.
pub const MAX_OWNERSHIP_DEPTH: usize = 32;

/// Which entities are currently visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewFilter {
    /// Empty means all namespaces.
    pub namespace: String,
    /// Empty means every kind.
    pub kinds: Vec<WorkloadKind>,
}

impl ViewFilter {
    pub fn new(namespace: impl Into<String>, kinds: Vec<WorkloadKind>) -> Self {
        Self {
            namespace: namespace.into(),
            kinds,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        !entity.deleted
            && (self.namespace.is_empty() || entity.namespace == self.namespace)
            && (self.kinds.is_empty() || self.kinds.contains(&entity.kind))
    }
}

/// Authoritative set of parent entities, keyed by UID.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<EntityId, Entity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later duplicates of the same UID replace earlier ones.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut registry = Self::new();
        for entity in entities {
            registry.entities.insert(entity.id.clone(), entity);
        }
        registry
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Insert or replace an entity. Returns true when the stored value changed.
    pub fn upsert(&mut self, entity: Entity) -> bool {
        match self.entities.get(&entity.id) {
            Some(existing) if *existing == entity => false,
            _ => {
                self.entities.insert(entity.id.clone(), entity);
                true
            }
        }
    }

    /// Mark an entity deleted without dropping it. Returns true on transition.
    pub fn mark_deleted(&mut self, id: &EntityId) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) if !entity.deleted => {
                entity.deleted = true;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn visible<'a>(&'a self, filter: &'a ViewFilter) -> impl Iterator<Item = &'a Entity> {
        self.entities.values().filter(|entity| filter.matches(entity))
    }

    pub fn visible_ids(&self, filter: &ViewFilter) -> Vec<EntityId> {
        self.visible(filter).map(|entity| entity.id.clone()).collect()
    }

    /// Whether `id` is registered and passes `filter`.
    pub fn is_visible(&self, id: &EntityId, filter: &ViewFilter) -> bool {
        self.get(id).is_some_and(|entity| filter.matches(entity))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Maps every entity to the flat set of leaves beneath it, and back.
#[derive(Debug, Clone, Default)]
pub struct ContainmentIndex {
    leaves_by_owner: HashMap<EntityId, BTreeSet<LeafId>>,
    owners_by_leaf: HashMap<LeafId, BTreeSet<EntityId>>,
    broken_links: usize,
}

enum Child<'a> {
    Entity(&'a EntityId),
    Leaf(&'a LeafId),
}

enum Frame<'a> {
    Enter(&'a EntityId, usize),
    Exit(&'a EntityId),
}

impl ContainmentIndex {
    /// Resolve ownership chains for every registered entity.
    ///
    /// Entities marked deleted contribute nothing to their owners. Owner
    /// references to unregistered UIDs are ignored. A node reached
    /// again while it is still on the current path (a cycle), or past
    /// [`MAX_OWNERSHIP_DEPTH`], is recorded as an unresolved leaf.
    pub fn build(registry: &EntityRegistry) -> Self {
        let mut children: HashMap<&EntityId, Vec<Child<'_>>> = HashMap::new();
        let mut orphans = 0usize;

        for entity in registry.iter().filter(|entity| !entity.deleted) {
            for owner in &entity.owners {
                if registry.contains(owner) {
                    children
                        .entry(owner)
                        .or_default()
                        .push(Child::Entity(&entity.id));
                } else {
                    orphans += 1;
                }
            }
            for leaf in &entity.leaves {
                children
                    .entry(&entity.id)
                    .or_default()
                    .push(Child::Leaf(leaf));
            }
        }

        let mut index = Self::default();
        for entity in registry.iter() {
            let (leaves, broken) = resolve(&entity.id, &children);
            index.broken_links += broken;
            if leaves.is_empty() {
                continue;
            }
            for leaf in &leaves {
                index
                    .owners_by_leaf
                    .entry(leaf.clone())
                    .or_default()
                    .insert(entity.id.clone());
            }
            index.leaves_by_owner.insert(entity.id.clone(), leaves);
        }

        if orphans > 0 {
            debug!(orphans, "Ignored owner references to unregistered entities");
        }
        if index.broken_links > 0 {
            warn!(
                broken_links = index.broken_links,
                result = "fail_closed",
                "Ownership graph has cycles or over-deep chains; affected nodes treated as leaves"
            );
        }

        index
    }

    pub fn leaves_of<'a>(&'a self, owner: &EntityId) -> impl Iterator<Item = &'a LeafId> + 'a {
        self.leaves_by_owner
            .get(owner)
            .into_iter()
            .flat_map(|leaves| leaves.iter())
    }

    pub fn owners_of<'a>(&'a self, leaf: &LeafId) -> impl Iterator<Item = &'a EntityId> + 'a {
        self.owners_by_leaf
            .get(leaf)
            .into_iter()
            .flat_map(|owners| owners.iter())
    }

    /// Number of ownership links broken while resolving (cycles, depth cap).
    pub fn broken_links(&self) -> usize {
        self.broken_links
    }

    /// Owners whose resolved leaf set differs between `previous` and `self`.
    pub fn changed_owners(&self, previous: &ContainmentIndex) -> HashSet<EntityId> {
        let mut changed = HashSet::new();
        for (owner, leaves) in &self.leaves_by_owner {
            if previous.leaves_by_owner.get(owner) != Some(leaves) {
                changed.insert(owner.clone());
            }
        }
        for owner in previous.leaves_by_owner.keys() {
            if !self.leaves_by_owner.contains_key(owner) {
                changed.insert(owner.clone());
            }
        }
        changed
    }
}

fn resolve<'a>(
    root: &'a EntityId,
    children: &HashMap<&'a EntityId, Vec<Child<'a>>>,
) -> (BTreeSet<LeafId>, usize) {
    let mut leaves = BTreeSet::new();
    let mut broken = 0usize;
    let mut on_path: HashSet<&EntityId> = HashSet::new();
    let mut done: HashSet<&EntityId> = HashSet::new();
    let mut stack = vec![Frame::Enter(root, 0)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Exit(id) => {
                on_path.remove(id);
                done.insert(id);
            }
            Frame::Enter(id, depth) => {
                if on_path.contains(id) || depth > MAX_OWNERSHIP_DEPTH {
                    broken += 1;
                    leaves.insert(LeafId::from(id));
                    continue;
                }
                if done.contains(id) {
                    continue;
                }
                let Some(kids) = children.get(id) else {
                    if id != root {
                        leaves.insert(LeafId::from(id));
                    }
                    continue;
                };

                on_path.insert(id);
                stack.push(Frame::Exit(id));
                for kid in kids {
                    match kid {
                        Child::Leaf(leaf) => {
                            leaves.insert((*leaf).clone());
                        }
                        Child::Entity(child) => stack.push(Frame::Enter(*child, depth + 1)),
                    }
                }
            }
        }
    }

    (leaves, broken)
}

/// Build a registry and its containment index from one snapshot.
pub fn build(entities: impl IntoIterator<Item = Entity>) -> (EntityRegistry, ContainmentIndex) {
    let registry = EntityRegistry::from_entities(entities);
    let index = ContainmentIndex::build(&registry);
    (registry, index)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entity(
        id: &str,
        kind: WorkloadKind,
        owners: &[&str],
        leaves: &[&str],
    ) -> Entity {
        Entity {
            id: EntityId::from(id),
            kind,
            namespace: "default".to_string(),
            name: id.to_string(),
            created_at: None,
            deleted: false,
            owners: owners.iter().map(|o| EntityId::from(*o)).collect(),
            leaves: leaves.iter().map(|l| LeafId::from(*l)).collect(),
        }
    }

    fn leaves(index: &ContainmentIndex, owner: &str) -> Vec<String> {
        index
            .leaves_of(&EntityId::from(owner))
            .map(|leaf| leaf.to_string())
            .collect()
    }

    #[test]
    fn resolves_transitive_ownership_chains() {
        let (_, index) = build([
            entity("deploy", WorkloadKind::Deployment, &[], &[]),
            entity("rs", WorkloadKind::ReplicaSet, &["deploy"], &[]),
            entity("pod-a", WorkloadKind::Pod, &["rs"], &["c1", "c2"]),
            entity("pod-b", WorkloadKind::Pod, &["rs"], &["c3"]),
        ]);

        assert_eq!(leaves(&index, "deploy"), vec!["c1", "c2", "c3"]);
        assert_eq!(leaves(&index, "rs"), vec!["c1", "c2", "c3"]);
        assert_eq!(leaves(&index, "pod-a"), vec!["c1", "c2"]);

        let owners: Vec<_> = index
            .owners_of(&LeafId::from("c3"))
            .map(|owner| owner.to_string())
            .collect();
        assert_eq!(owners, vec!["deploy", "pod-b", "rs"]);
        assert_eq!(index.broken_links(), 0);
    }

    #[test]
    fn orphan_owner_references_are_ignored() {
        let (registry, index) = build([entity("pod", WorkloadKind::Pod, &["missing"], &["c1"])]);

        assert_eq!(registry.len(), 1);
        assert_eq!(leaves(&index, "pod"), vec!["c1"]);
        assert_eq!(leaves(&index, "missing"), Vec::<String>::new());
    }

    #[test]
    fn childless_controller_is_classified_as_leaf() {
        let (_, index) = build([
            entity("deploy", WorkloadKind::Deployment, &[], &[]),
            entity("rs-empty", WorkloadKind::ReplicaSet, &["deploy"], &[]),
        ]);

        assert_eq!(leaves(&index, "deploy"), vec!["rs-empty"]);
        assert_eq!(leaves(&index, "rs-empty"), Vec::<String>::new());
    }

    #[test]
    fn ownership_cycle_is_broken_instead_of_looping() {
        let (_, index) = build([
            entity("a", WorkloadKind::ReplicaSet, &["b"], &["ca"]),
            entity("b", WorkloadKind::ReplicaSet, &["a"], &["cb"]),
        ]);

        let a = leaves(&index, "a");
        assert!(a.contains(&"ca".to_string()));
        assert!(a.contains(&"cb".to_string()));
        assert!(index.broken_links() >= 2);
    }

    #[test]
    fn shared_descendants_are_not_counted_as_cycles() {
        let (_, index) = build([
            entity("top", WorkloadKind::Deployment, &[], &[]),
            entity("left", WorkloadKind::ReplicaSet, &["top"], &[]),
            entity("right", WorkloadKind::ReplicaSet, &["top"], &[]),
            entity("pod", WorkloadKind::Pod, &["left", "right"], &["c1"]),
        ]);

        assert_eq!(leaves(&index, "top"), vec!["c1"]);
        assert_eq!(index.broken_links(), 0);
    }

    #[test]
    fn deep_chains_stop_at_the_depth_cap() {
        let count = MAX_OWNERSHIP_DEPTH + 5;
        let mut entities = Vec::new();
        for i in 0..count {
            let id = format!("n{i}");
            let owner = (i > 0).then(|| format!("n{}", i - 1));
            let mut node = entity(&id, WorkloadKind::ReplicaSet, &[], &[]);
            node.owners = owner.into_iter().map(EntityId::from).collect();
            if i == count - 1 {
                node.leaves = vec![LeafId::from("deep")];
            }
            entities.push(node);
        }

        let (_, index) = build(entities);
        assert!(!leaves(&index, "n0").contains(&"deep".to_string()));
        assert!(index.broken_links() > 0);
        assert_eq!(leaves(&index, &format!("n{}", count - 1)), vec!["deep"]);
    }

    #[test]
    fn deleted_children_do_not_count_toward_owners() {
        let mut gone = entity("pod-b", WorkloadKind::Pod, &["rs"], &["c3"]);
        gone.deleted = true;
        let (_, index) = build([
            entity("rs", WorkloadKind::ReplicaSet, &[], &[]),
            entity("pod-a", WorkloadKind::Pod, &["rs"], &["c1"]),
            gone,
        ]);

        assert_eq!(leaves(&index, "rs"), vec!["c1"]);
        assert!(leaves(&index, "pod-b").is_empty());
        assert_eq!(index.owners_of(&LeafId::from("c3")).count(), 0);
    }

    #[test]
    fn filter_hides_deleted_and_other_namespaces() {
        let mut other = entity("p2", WorkloadKind::Pod, &[], &[]);
        other.namespace = "kube-system".to_string();
        let mut gone = entity("p3", WorkloadKind::Pod, &[], &[]);
        gone.deleted = true;
        let registry = EntityRegistry::from_entities([
            entity("p1", WorkloadKind::Pod, &[], &[]),
            other,
            gone,
            entity("rs", WorkloadKind::ReplicaSet, &[], &[]),
        ]);

        let filter = ViewFilter::new("default", vec![WorkloadKind::Pod]);
        let visible: Vec<_> = registry.visible(&filter).map(|e| e.id.to_string()).collect();
        assert_eq!(visible, vec!["p1"]);
    }

    #[test]
    fn changed_owners_reports_leaf_set_differences() {
        let (_, before) = build([entity("pod", WorkloadKind::Pod, &[], &["c1"])]);
        let (_, after) = build([
            entity("pod", WorkloadKind::Pod, &[], &["c1", "c2"]),
            entity("new", WorkloadKind::Pod, &[], &["c9"]),
        ]);

        let changed = after.changed_owners(&before);
        assert!(changed.contains(&EntityId::from("pod")));
        assert!(changed.contains(&EntityId::from("new")));
        assert_eq!(changed.len(), 2);
    }
}
