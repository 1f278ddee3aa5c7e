//! Tracks which stored items reference which, so that a change to one item can be propagated to
//! everything depending on it, and so that data can be written in dependency order.
//!
//! Flags depend on their prerequisite flags and on segments referenced by `segmentMatch` clauses.
//! Segments depend on segments referenced by their rules.
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::{
    models::{Clause, Operator},
    Str,
};

use super::{DataKind, FullDataSet, Item, ItemDescriptor, KeyedItems, KindAndKey};

/// Dependency graph between stored items.
///
/// Not internally synchronized: callers are expected to update it under the same lock that
/// serializes their store writes.
#[derive(Debug, Default, Clone)]
pub struct DependencyTracker {
    /// Outbound edges: item → items it references.
    dependencies_from: HashMap<KindAndKey, HashSet<KindAndKey>>,
    /// Inbound edges, derived from `dependencies_from` on first use after a change.
    dependencies_to: Option<HashMap<KindAndKey, HashSet<KindAndKey>>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    /// Replace the outbound edges of `key` with the references found in `item`.
    pub fn update_dependencies_from(&mut self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let from = KindAndKey::new(kind, Str::new(key));
        let dependencies = item_dependencies(item);
        log::trace!(target: "flag_engine",
                    item:display = from,
                    count = dependencies.len();
                    "updated item dependencies");
        if dependencies.is_empty() {
            self.dependencies_from.remove(&from);
        } else {
            self.dependencies_from.insert(from, dependencies);
        }
        self.dependencies_to = None;
    }

    /// Add `item` and everything that transitively depends on it to `affected`.
    pub fn add_affected_items(&mut self, affected: &mut HashSet<KindAndKey>, item: &KindAndKey) {
        let dependencies_to = self
            .dependencies_to
            .get_or_insert_with(|| invert(&self.dependencies_from));

        let mut queue = VecDeque::new();
        if affected.insert(item.clone()) {
            queue.push_back(item.clone());
        }
        while let Some(current) = queue.pop_front() {
            let Some(dependents) = dependencies_to.get(&current) else {
                continue;
            };
            for dependent in dependents {
                if affected.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
    }

    /// Forget all dependencies.
    pub fn reset(&mut self) {
        self.dependencies_from.clear();
        self.dependencies_to = None;
    }

    /// Reorder a full data set so that no item is written before the items it depends on.
    ///
    /// Segments come before flags, and other kinds follow in their input order. Within segments
    /// and flags, every item comes after the items of the same kind it references. Items with
    /// equal standing keep their input order. Items caught in a reference cycle are appended in
    /// input order after everything that could be placed.
    pub fn sort_all_collections(all_data: FullDataSet) -> FullDataSet {
        let mut segments = Vec::new();
        let mut features = Vec::new();
        let mut others = Vec::new();
        for (kind, items) in all_data {
            match kind {
                DataKind::Segments => segments.push((kind, items)),
                DataKind::Features => features.push((kind, items)),
                DataKind::Custom(_) => others.push((kind, items)),
            }
        }

        segments
            .into_iter()
            .chain(features)
            .map(|(kind, items)| {
                let items = sort_items(&kind, items);
                (kind, items)
            })
            .chain(others)
            .collect()
    }
}

fn invert(
    dependencies_from: &HashMap<KindAndKey, HashSet<KindAndKey>>,
) -> HashMap<KindAndKey, HashSet<KindAndKey>> {
    let mut dependencies_to: HashMap<KindAndKey, HashSet<KindAndKey>> = HashMap::new();
    for (from, dependencies) in dependencies_from {
        for to in dependencies {
            dependencies_to
                .entry(to.clone())
                .or_default()
                .insert(from.clone());
        }
    }
    dependencies_to
}

fn item_dependencies(item: &ItemDescriptor) -> HashSet<KindAndKey> {
    match &item.item {
        Some(Item::Flag(flag)) => flag
            .prerequisites
            .iter()
            .map(|prerequisite| KindAndKey::new(DataKind::Features, prerequisite.key.clone()))
            .chain(segment_references(
                flag.rules.iter().flat_map(|rule| &rule.clauses),
            ))
            .collect(),
        Some(Item::Segment(segment)) => {
            segment_references(segment.rules.iter().flat_map(|rule| &rule.clauses)).collect()
        }
        Some(Item::Custom(_)) | None => HashSet::new(),
    }
}

fn segment_references<'a>(
    clauses: impl Iterator<Item = &'a Clause> + 'a,
) -> impl Iterator<Item = KindAndKey> + 'a {
    clauses
        .filter(|clause| clause.op == Operator::SegmentMatch)
        .flat_map(|clause| &clause.values)
        .filter_map(|value| value.as_str())
        .map(|key| KindAndKey::new(DataKind::Segments, key.to_owned()))
}

/// Stable topological sort of one collection. Ready items are emitted lowest input index first.
fn sort_items(kind: &DataKind, items: KeyedItems) -> KeyedItems {
    let index_of: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (key.as_str(), i))
        .collect();

    let mut pending = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    for (i, (_, item)) in items.iter().enumerate() {
        let dependencies: HashSet<usize> = item_dependencies(item)
            .into_iter()
            .filter(|dependency| &dependency.kind == kind)
            .filter_map(|dependency| index_of.get(dependency.key.as_str()).copied())
            .filter(|&j| j != i)
            .collect();
        pending[i] = dependencies.len();
        for j in dependencies {
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..items.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(items.len());
    let mut placed = vec![false; items.len()];
    while let Some(i) = ready.pop_first() {
        order.push(i);
        placed[i] = true;
        for &dependent in &dependents[i] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < items.len() {
        log::warn!(target: "flag_engine",
                   kind:display = kind,
                   count = items.len() - order.len();
                   "reference cycle between items, appending them in input order");
        order.extend((0..items.len()).filter(|&i| !placed[i]));
    }

    let mut slots: Vec<Option<(Str, ItemDescriptor)>> =
        items.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::DependencyTracker;
    use crate::{
        compiled::{FeatureFlag, Segment},
        store::{DataKind, FullDataSet, ItemDescriptor, KindAndKey},
        Str,
    };

    fn flag(key: &str, prerequisites: &[&str], segments: &[&str]) -> ItemDescriptor {
        let prerequisites: Vec<_> = prerequisites
            .iter()
            .map(|key| json!({"key": key, "variation": 0}))
            .collect();
        let rules: Vec<_> = segments
            .iter()
            .map(|segment| {
                json!({
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": [segment]}],
                    "variation": 0,
                })
            })
            .collect();
        let flag: FeatureFlag = serde_json::from_value(json!({
            "key": key,
            "version": 1,
            "prerequisites": prerequisites,
            "rules": rules,
        }))
        .unwrap();
        ItemDescriptor::flag(flag)
    }

    fn segment(key: &str, segments: &[&str]) -> ItemDescriptor {
        let rules: Vec<_> = segments
            .iter()
            .map(|segment| {
                json!({
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": [segment]}],
                })
            })
            .collect();
        let segment: Segment = serde_json::from_value(json!({
            "key": key,
            "version": 1,
            "rules": rules,
        }))
        .unwrap();
        ItemDescriptor::segment(segment)
    }

    fn feature(key: &str) -> KindAndKey {
        KindAndKey::new(DataKind::Features, Str::new(key))
    }

    fn keys(data: &FullDataSet, kind: &DataKind) -> Vec<String> {
        data.iter()
            .find(|(k, _)| k == kind)
            .map(|(_, items)| items.iter().map(|(key, _)| key.to_string()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn affected_items_are_transitive_and_reset_clears_them() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Features, "F1", &flag("F1", &["F2"], &[]));
        tracker.update_dependencies_from(DataKind::Features, "F2", &flag("F2", &["F3"], &[]));
        tracker.update_dependencies_from(DataKind::Features, "F3", &flag("F3", &[], &[]));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("F3"));
        assert_eq!(
            affected,
            HashSet::from([feature("F1"), feature("F2"), feature("F3")])
        );

        tracker.reset();
        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("F3"));
        assert_eq!(affected, HashSet::from([feature("F3")]));
    }

    #[test]
    fn segment_changes_affect_referencing_flags() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Segments, "S2", &segment("S2", &["S1"]));
        tracker.update_dependencies_from(DataKind::Features, "F", &flag("F", &[], &["S2"]));

        let mut affected = HashSet::new();
        let s1 = KindAndKey::new(DataKind::Segments, "S1");
        tracker.add_affected_items(&mut affected, &s1);
        assert_eq!(
            affected,
            HashSet::from([
                s1,
                KindAndKey::new(DataKind::Segments, "S2"),
                feature("F")
            ])
        );
    }

    #[test]
    fn updating_an_item_drops_its_old_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Features, "F1", &flag("F1", &["F2"], &[]));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("F2"));
        assert!(affected.contains(&feature("F1")));

        tracker.update_dependencies_from(DataKind::Features, "F1", &flag("F1", &["F3"], &[]));
        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("F2"));
        assert_eq!(affected, HashSet::from([feature("F2")]));

        tracker.update_dependencies_from(DataKind::Features, "F1", &ItemDescriptor::tombstone(2));
        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("F3"));
        assert_eq!(affected, HashSet::from([feature("F3")]));
    }

    #[test]
    fn dependency_cycles_terminate() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_from(DataKind::Features, "A", &flag("A", &["B"], &[]));
        tracker.update_dependencies_from(DataKind::Features, "B", &flag("B", &["A"], &[]));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &feature("A"));
        assert_eq!(affected, HashSet::from([feature("A"), feature("B")]));
    }

    #[test]
    fn sort_puts_segments_first_and_prerequisites_before_flags() {
        let custom = DataKind::Custom("other".into());
        let data = vec![
            (
                custom.clone(),
                vec![("x".into(), ItemDescriptor::tombstone(1))],
            ),
            (
                DataKind::Features,
                vec![
                    ("a".into(), flag("a", &["b", "c"], &["s1"])),
                    ("b".into(), flag("b", &["c"], &[])),
                    ("c".into(), flag("c", &[], &[])),
                    ("d".into(), flag("d", &["missing"], &[])),
                    ("e".into(), flag("e", &["e"], &[])),
                ],
            ),
            (
                DataKind::Segments,
                vec![
                    ("s1".into(), segment("s1", &["s2"])),
                    ("s2".into(), segment("s2", &[])),
                ],
            ),
        ];

        let sorted = DependencyTracker::sort_all_collections(data);

        let kinds: Vec<_> = sorted.iter().map(|(kind, _)| kind.clone()).collect();
        assert_eq!(kinds, vec![DataKind::Segments, DataKind::Features, custom]);
        assert_eq!(keys(&sorted, &DataKind::Segments), vec!["s2", "s1"]);
        assert_eq!(
            keys(&sorted, &DataKind::Features),
            vec!["c", "b", "a", "d", "e"]
        );
    }

    #[test]
    fn sort_keeps_every_item_of_a_cycle() {
        let data = vec![(
            DataKind::Features,
            vec![
                ("a".into(), flag("a", &["b"], &[])),
                ("b".into(), flag("b", &["a"], &[])),
                ("c".into(), flag("c", &[], &[])),
            ],
        )];

        let sorted = DependencyTracker::sort_all_collections(data);

        assert_eq!(keys(&sorted, &DataKind::Features), vec!["c", "a", "b"]);
    }
}
