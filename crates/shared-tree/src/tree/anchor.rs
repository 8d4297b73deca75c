//! Anchors: stable references to nodes that survive edits elsewhere.
//!
//! # Overview
//!
//! An [`AnchorSet`] keeps an arena of path nodes. Each path node records its
//! parent (another path node, or the document root), the field it sits in and
//! its index there. Anchors map to path nodes; only paths leading to anchored
//! nodes exist in the arena.
//!
//! The set is itself a delta visitor: applying a delta to the set shifts
//! indices on attach and detach, drops path nodes (and their anchors) on
//! delete, and carries moved path nodes to their destination.

use std::collections::{BTreeMap, HashMap};

use super::node::FieldKey;
use super::path::{NodePath, PathStep};
use crate::delta::{DeltaVisitor, MoveId};
use crate::tree::{TreeNode, TreeValue};

/// Handle to a tracked node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Anchor(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PathNodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Root,
    Node(PathNodeId),
    /// Moved out and not yet moved in; the index is the offset within the
    /// moved range.
    InTransit(MoveId),
}

#[derive(Debug, Clone)]
struct PathNode {
    parent: Link,
    field: FieldKey,
    index: usize,
    anchors: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AnchorSet {
    nodes: Vec<Option<PathNode>>,
    free: Vec<usize>,
    anchors: BTreeMap<Anchor, PathNodeId>,
    next_anchor: u64,
}

impl AnchorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Starts tracking the node at `path`.
    pub fn track(&mut self, path: &[PathStep]) -> Anchor {
        let anchor = Anchor(self.next_anchor);
        self.next_anchor += 1;
        self.track_as(anchor, path);
        anchor
    }

    fn track_as(&mut self, anchor: Anchor, path: &[PathStep]) {
        let mut parent = Link::Root;
        for step in path {
            let id = match self.find_child(parent, &step.field, step.index) {
                Some(id) => id,
                None => self.alloc(PathNode {
                    parent,
                    field: step.field.clone(),
                    index: step.index,
                    anchors: 0,
                }),
            };
            parent = Link::Node(id);
        }
        if let Link::Node(id) = parent {
            if let Some(node) = self.get_mut(id) {
                node.anchors += 1;
            }
            self.anchors.insert(anchor, id);
        }
    }

    /// Current path of the anchored node; `None` once the node is deleted.
    pub fn locate(&self, anchor: Anchor) -> Option<NodePath> {
        let id = *self.anchors.get(&anchor)?;
        self.path_of(id)
    }

    pub fn forget(&mut self, anchor: Anchor) {
        let Some(id) = self.anchors.remove(&anchor) else {
            return;
        };
        if let Some(node) = self.get_mut(id) {
            node.anchors = node.anchors.saturating_sub(1);
        }
        self.collect_unused();
    }

    /// Re-tracks anchors of `snapshot` that this set lost, at the paths they
    /// had in `snapshot`.
    pub fn restore_missing(&mut self, snapshot: &AnchorSet) {
        let missing: Vec<(Anchor, NodePath)> = snapshot
            .anchors
            .keys()
            .filter(|anchor| !self.anchors.contains_key(anchor))
            .filter_map(|anchor| Some((*anchor, snapshot.locate(*anchor)?)))
            .collect();
        for (anchor, path) in missing {
            self.track_as(anchor, &path);
        }
        self.next_anchor = self.next_anchor.max(snapshot.next_anchor);
    }

    /// Visitor that keeps this set in sync with a delta being applied.
    pub(crate) fn visitor(&mut self) -> AnchorVisitor<'_> {
        AnchorVisitor {
            set: self,
            node: Vec::new(),
            fields: Vec::new(),
        }
    }

    // ──────────────────────────────────────── Arena

    fn alloc(&mut self, node: PathNode) -> PathNodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                PathNodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                PathNodeId(self.nodes.len() - 1)
            }
        }
    }

    fn get(&self, id: PathNodeId) -> Option<&PathNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: PathNodeId) -> Option<&mut PathNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn live(&self) -> impl Iterator<Item = (PathNodeId, &PathNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|node| (PathNodeId(slot), node)))
    }

    fn find_child(&self, parent: Link, field: &FieldKey, index: usize) -> Option<PathNodeId> {
        self.live()
            .find(|(_, node)| node.parent == parent && node.field == *field && node.index == index)
            .map(|(id, _)| id)
    }

    /// Resolves a root-down path to the path node, if one exists.
    fn resolve(&self, path: &[PathStep]) -> Option<Link> {
        let mut link = Link::Root;
        for step in path {
            link = Link::Node(self.find_child(link, &step.field, step.index)?);
        }
        Some(link)
    }

    fn path_of(&self, id: PathNodeId) -> Option<NodePath> {
        let mut steps = Vec::new();
        let mut current = id;
        loop {
            let node = self.get(current)?;
            steps.push(PathStep {
                field: node.field.clone(),
                index: node.index,
            });
            match node.parent {
                Link::Root => break,
                Link::Node(parent) => current = parent,
                Link::InTransit(_) => return None,
            }
        }
        steps.reverse();
        Some(steps)
    }

    /// Ids of the children of `parent` in `field`.
    fn children_in(&self, parent: Link, field: &FieldKey) -> Vec<PathNodeId> {
        self.live()
            .filter(|(_, node)| node.parent == parent && node.field == *field)
            .map(|(id, _)| id)
            .collect()
    }

    fn is_under(&self, id: PathNodeId, ancestors: &[PathNodeId]) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if ancestors.contains(&cur) {
                return true;
            }
            current = match self.get(cur).map(|node| node.parent) {
                Some(Link::Node(parent)) => Some(parent),
                _ => None,
            };
        }
        false
    }

    fn remove_subtrees(&mut self, roots: &[PathNodeId]) {
        if roots.is_empty() {
            return;
        }
        let doomed: Vec<PathNodeId> = self
            .live()
            .map(|(id, _)| id)
            .filter(|id| self.is_under(*id, roots))
            .collect();
        for id in &doomed {
            self.nodes[id.0] = None;
            self.free.push(id.0);
        }
        self.anchors.retain(|_, id| !doomed.contains(id));
    }

    /// Drops path nodes that no anchor depends on.
    fn collect_unused(&mut self) {
        loop {
            let unused: Vec<PathNodeId> = self
                .live()
                .filter(|(id, node)| {
                    node.anchors == 0
                        && !self.live().any(|(_, other)| other.parent == Link::Node(*id))
                })
                .map(|(id, _)| id)
                .collect();
            if unused.is_empty() {
                return;
            }
            for id in unused {
                self.nodes[id.0] = None;
                self.free.push(id.0);
            }
        }
    }
}

/// Applies visited changes to an [`AnchorSet`].
pub(crate) struct AnchorVisitor<'a> {
    set: &'a mut AnchorSet,
    node: Vec<PathStep>,
    fields: Vec<FieldKey>,
}

impl AnchorVisitor<'_> {
    /// The parent link and field the visitor is positioned in, when any
    /// anchored node could live there.
    fn position(&self) -> Option<(Link, FieldKey)> {
        let field = self.fields.last()?.clone();
        let parent = self.set.resolve(&self.node)?;
        Some((parent, field))
    }

    fn shift(&mut self, parent: Link, field: &FieldKey, from: usize, by: isize) {
        for id in self.set.children_in(parent, field) {
            if let Some(node) = self.set.get_mut(id) {
                if node.index >= from {
                    node.index = node.index.saturating_add_signed(by);
                }
            }
        }
    }

    fn in_range(&self, parent: Link, field: &FieldKey, index: usize, count: usize) -> Vec<PathNodeId> {
        self.set
            .children_in(parent, field)
            .into_iter()
            .filter(|id| {
                self.set
                    .get(*id)
                    .is_some_and(|node| node.index >= index && node.index < index + count)
            })
            .collect()
    }
}

impl DeltaVisitor for AnchorVisitor<'_> {
    fn on_delete(&mut self, index: usize, count: usize) {
        let Some((parent, field)) = self.position() else {
            return;
        };
        let doomed = self.in_range(parent, &field, index, count);
        self.set.remove_subtrees(&doomed);
        self.shift(parent, &field, index + count, -(count as isize));
    }

    fn on_insert(&mut self, index: usize, content: &[TreeNode]) {
        let Some((parent, field)) = self.position() else {
            return;
        };
        self.shift(parent, &field, index, content.len() as isize);
    }

    fn on_move_out(&mut self, index: usize, count: usize, id: MoveId) {
        let Some((parent, field)) = self.position() else {
            return;
        };
        for moved in self.in_range(parent, &field, index, count) {
            if let Some(node) = self.set.get_mut(moved) {
                node.parent = Link::InTransit(id);
                node.index -= index;
            }
        }
        self.shift(parent, &field, index + count, -(count as isize));
    }

    fn on_move_in(&mut self, index: usize, count: usize, id: MoveId) {
        let in_transit: Vec<PathNodeId> = self
            .set
            .live()
            .filter(|(_, node)| node.parent == Link::InTransit(id))
            .map(|(node_id, _)| node_id)
            .collect();
        let Some(field) = self.fields.last().cloned() else {
            return;
        };
        let parent = match self.set.resolve(&self.node) {
            Some(parent) => parent,
            None if in_transit.is_empty() => return,
            None => {
                // Destination has no path node yet; create the chain to it.
                let mut link = Link::Root;
                for step in self.node.clone() {
                    link = Link::Node(match self.set.find_child(link, &step.field, step.index) {
                        Some(existing) => existing,
                        None => self.set.alloc(PathNode {
                            parent: link,
                            field: step.field.clone(),
                            index: step.index,
                            anchors: 0,
                        }),
                    });
                }
                link
            }
        };
        self.shift(parent, &field, index, count as isize);
        for moved in in_transit {
            if let Some(node) = self.set.get_mut(moved) {
                node.parent = parent;
                node.field = field.clone();
                node.index += index;
            }
        }
    }

    fn on_set_value(&mut self, _value: &TreeValue) {}

    fn enter_node(&mut self, index: usize) {
        let field = self.fields.last().cloned().unwrap_or_else(|| FieldKey::new(""));
        self.node.push(PathStep { field, index });
    }

    fn exit_node(&mut self, _index: usize) {
        self.node.pop();
    }

    fn enter_field(&mut self, key: &FieldKey) {
        self.fields.push(key.clone());
    }

    fn exit_field(&mut self, _key: &FieldKey) {
        self.fields.pop();
    }
}

/// Anchors are compared by where they point, not by arena layout.
impl PartialEq for AnchorSet {
    fn eq(&self, other: &Self) -> bool {
        let located = |set: &AnchorSet| -> HashMap<Anchor, Option<NodePath>> {
            set.anchors.keys().map(|a| (*a, set.locate(*a))).collect()
        };
        located(self) == located(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{visit_delta, Mark, Modify, Root};
    use serde_json::json;

    fn apply(set: &mut AnchorSet, root: &Root) {
        let mut visitor = set.visitor();
        visit_delta(root, &mut visitor);
    }

    fn single_field(key: &str, marks: Vec<Mark>) -> Root {
        let mut root = Root::new();
        root.insert(key.into(), marks);
        root
    }

    #[test]
    fn insert_before_anchor_shifts_it() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&[PathStep::new("a", 1), PathStep::new("b", 0)]);
        apply(
            &mut set,
            &single_field(
                "a",
                vec![Mark::Insert {
                    content: vec![TreeNode::leaf("Leaf", json!(0))],
                    modify: Modify::default(),
                }],
            ),
        );
        assert_eq!(
            set.locate(anchor),
            Some(vec![PathStep::new("a", 2), PathStep::new("b", 0)])
        );
    }

    #[test]
    fn deleting_an_ancestor_drops_the_anchor() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&[PathStep::new("a", 1), PathStep::new("b", 0)]);
        let survivor = set.track(&[PathStep::new("a", 2)]);
        apply(
            &mut set,
            &single_field(
                "a",
                vec![
                    Mark::Skip(1),
                    Mark::Delete {
                        count: 1,
                        modify: Modify::default(),
                    },
                ],
            ),
        );
        assert_eq!(set.locate(anchor), None);
        assert_eq!(set.locate(survivor), Some(vec![PathStep::new("a", 1)]));
    }

    #[test]
    fn anchors_follow_moves_across_fields() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&[PathStep::new("a", 1)]);
        let mut root = Root::new();
        root.insert(
            "a".into(),
            vec![Mark::MoveOut {
                count: 2,
                move_id: MoveId(3),
                modify: Modify::default(),
            }],
        );
        root.insert(
            "b".into(),
            vec![
                Mark::Skip(4),
                Mark::MoveIn {
                    count: 2,
                    move_id: MoveId(3),
                },
            ],
        );
        apply(&mut set, &root);
        assert_eq!(set.locate(anchor), Some(vec![PathStep::new("b", 5)]));
    }

    #[test]
    fn forget_releases_path_nodes() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&[PathStep::new("a", 0), PathStep::new("b", 0)]);
        set.forget(anchor);
        assert!(set.is_empty());
        assert_eq!(set.live().count(), 0);
    }

    #[test]
    fn restore_missing_re_adds_lost_anchors() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&[PathStep::new("a", 0)]);
        let snapshot = set.clone();
        apply(
            &mut set,
            &single_field(
                "a",
                vec![Mark::Delete {
                    count: 1,
                    modify: Modify::default(),
                }],
            ),
        );
        assert_eq!(set.locate(anchor), None);
        set.restore_missing(&snapshot);
        assert_eq!(set.locate(anchor), Some(vec![PathStep::new("a", 0)]));
        assert_eq!(set, snapshot);
    }
}
