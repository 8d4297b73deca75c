use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::node::{FieldKey, FieldMap, TreeNode, TreeValue};
use super::path::{FieldPath, PathStep};
use crate::delta::{DeltaVisitor, MoveId};

/// Document content: the root fields and everything under them.
///
/// Fields never hold an empty sequence: emptied fields are removed so that
/// equal documents compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Forest {
    roots: FieldMap,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: FieldMap) -> Self {
        let mut forest = Forest { roots: fields };
        forest.roots.retain(|_, nodes| !nodes.is_empty());
        forest
    }

    pub fn fields(&self) -> &FieldMap {
        &self.roots
    }

    pub fn root_field(&self, key: &FieldKey) -> &[TreeNode] {
        self.roots.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node(&self, path: &[PathStep]) -> Option<&TreeNode> {
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.get(&first.field)?.get(first.index)?;
        for step in rest {
            node = node.fields.get(&step.field)?.get(step.index)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &[PathStep]) -> Option<&mut TreeNode> {
        let (first, rest) = path.split_first()?;
        let mut node = self.roots.get_mut(&first.field)?.get_mut(first.index)?;
        for step in rest {
            node = node.fields.get_mut(&step.field)?.get_mut(step.index)?;
        }
        Some(node)
    }

    /// The nodes of a field; `None` when the owning node does not exist.
    pub fn field(&self, path: &FieldPath) -> Option<&[TreeNode]> {
        let fields = if path.node.is_empty() {
            &self.roots
        } else {
            &self.node(&path.node)?.fields
        };
        Some(fields.get(&path.field).map(Vec::as_slice).unwrap_or(&[]))
    }

    fn fields_mut(&mut self, node: &[PathStep]) -> Option<&mut FieldMap> {
        if node.is_empty() {
            Some(&mut self.roots)
        } else {
            Some(&mut self.node_mut(node)?.fields)
        }
    }

    pub fn value(&self, path: &[PathStep]) -> Option<&TreeValue> {
        self.node(path).map(|node| &node.value)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Visitor that applies a delta to this forest.
    pub(crate) fn visitor(&mut self) -> ForestVisitor<'_> {
        ForestVisitor {
            forest: self,
            node: Vec::new(),
            fields: Vec::new(),
            detached: HashMap::new(),
            fault: None,
        }
    }
}

impl From<BTreeMap<FieldKey, Vec<TreeNode>>> for Forest {
    fn from(fields: BTreeMap<FieldKey, Vec<TreeNode>>) -> Self {
        Forest::from_fields(fields)
    }
}

/// Applies visited changes to a [`Forest`].
pub(crate) struct ForestVisitor<'f> {
    forest: &'f mut Forest,
    node: Vec<PathStep>,
    fields: Vec<FieldKey>,
    detached: HashMap<MoveId, Vec<TreeNode>>,
    fault: Option<String>,
}

impl ForestVisitor<'_> {
    /// First inconsistency met while visiting, if any.
    pub fn finish(self) -> Result<(), String> {
        match self.fault {
            Some(fault) => Err(fault),
            None if !self.detached.is_empty() => Err("moved-out content was never moved in".into()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, message: String) {
        self.fault.get_or_insert(message);
    }

    fn current_field(&mut self) -> Option<&mut Vec<TreeNode>> {
        let key = self.fields.last()?.clone();
        let fields = self.forest.fields_mut(&self.node)?;
        Some(fields.entry(key).or_default())
    }

    fn splice(&mut self, index: usize, content: Vec<TreeNode>) {
        let Some(field) = self.current_field() else {
            self.fail(format!("attach at {index}: no such field"));
            return;
        };
        if index > field.len() {
            let len = field.len();
            self.fail(format!("attach at {index} past the end of a field of {len}"));
            return;
        }
        field.splice(index..index, content);
    }

    fn drain(&mut self, index: usize, count: usize) -> Vec<TreeNode> {
        let Some(field) = self.current_field() else {
            self.fail(format!("detach at {index}: no such field"));
            return Vec::new();
        };
        let Some(end) = index.checked_add(count).filter(|end| *end <= field.len()) else {
            let len = field.len();
            self.fail(format!("detach {count} at {index} from a field of {len}"));
            return Vec::new();
        };
        field.drain(index..end).collect()
    }
}

impl DeltaVisitor for ForestVisitor<'_> {
    fn on_delete(&mut self, index: usize, count: usize) {
        self.drain(index, count);
    }

    fn on_insert(&mut self, index: usize, content: &[TreeNode]) {
        self.splice(index, content.to_vec());
    }

    fn on_move_out(&mut self, index: usize, count: usize, id: MoveId) {
        let nodes = self.drain(index, count);
        self.detached.insert(id, nodes);
    }

    fn on_move_in(&mut self, index: usize, _count: usize, id: MoveId) {
        match self.detached.remove(&id) {
            Some(nodes) => self.splice(index, nodes),
            None => self.fail(format!("move in of unknown move {}", id.0)),
        }
    }

    fn on_set_value(&mut self, value: &TreeValue) {
        match self.forest.node_mut(&self.node) {
            Some(node) => node.value = value.clone(),
            None => self.fail("set value of a missing node".into()),
        }
    }

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

    fn exit_field(&mut self, key: &FieldKey) {
        if let Some(fields) = self.forest.fields_mut(&self.node) {
            if fields.get(key).is_some_and(Vec::is_empty) {
                fields.remove(key);
            }
        }
        self.fields.pop();
    }
}
