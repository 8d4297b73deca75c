//! Locations in a document.
//!
//! Changesets address nodes root-down with [`NodePath`] (a list of
//! [`PathStep`]s) and fields with [`FieldPath`]. [`UpPath`] is the
//! parent-linked form handed out to callers: immutable, and sharing its
//! prefix with every path derived from it.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::node::FieldKey;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathStep {
    pub field: FieldKey,
    pub index: usize,
}

impl PathStep {
    pub fn new(field: impl Into<FieldKey>, index: usize) -> Self {
        Self {
            field: field.into(),
            index,
        }
    }
}

/// Root-down path to a node; empty for the document root.
pub type NodePath = Vec<PathStep>;

/// A field of the node at `node` (a root field when `node` is empty).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub node: NodePath,
    pub field: FieldKey,
}

impl FieldPath {
    pub fn root(field: impl Into<FieldKey>) -> Self {
        Self {
            node: Vec::new(),
            field: field.into(),
        }
    }

    pub fn new(node: NodePath, field: impl Into<FieldKey>) -> Self {
        Self {
            node,
            field: field.into(),
        }
    }

    /// Path of the child at `index` of this field.
    pub fn child(&self, index: usize) -> NodePath {
        let mut path = self.node.clone();
        path.push(PathStep {
            field: self.field.clone(),
            index,
        });
        path
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.node {
            write!(f, "{}[{}].", step.field, step.index)?;
        }
        write!(f, "{}", self.field)
    }
}

/// Renders a node path as `a[0].b[2]`; the document root renders as `/`.
pub fn display_path(path: &[PathStep]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter()
        .map(|step| format!("{}[{}]", step.field, step.index))
        .collect::<Vec<_>>()
        .join(".")
}

/// The field path a node lives in together with its index there.
pub fn split_node_path(path: &[PathStep]) -> Option<(FieldPath, usize)> {
    let (last, parent) = path.split_last()?;
    Some((
        FieldPath {
            node: parent.to_vec(),
            field: last.field.clone(),
        },
        last.index,
    ))
}

/// `true` when `prefix` is `path` or one of its ancestors.
pub fn is_prefix(prefix: &[PathStep], path: &[PathStep]) -> bool {
    prefix.len() <= path.len() && path[..prefix.len()] == *prefix
}

#[derive(Debug, PartialEq, Eq)]
struct UpPathNode {
    parent: Option<UpPath>,
    parent_field: FieldKey,
    parent_index: usize,
}

/// Immutable, parent-linked locator of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpPath(Rc<UpPathNode>);

impl UpPath {
    /// A node of a root field.
    pub fn root(field: impl Into<FieldKey>, index: usize) -> Self {
        UpPath(Rc::new(UpPathNode {
            parent: None,
            parent_field: field.into(),
            parent_index: index,
        }))
    }

    pub fn child(&self, field: impl Into<FieldKey>, index: usize) -> Self {
        UpPath(Rc::new(UpPathNode {
            parent: Some(self.clone()),
            parent_field: field.into(),
            parent_index: index,
        }))
    }

    pub fn parent(&self) -> Option<&UpPath> {
        self.0.parent.as_ref()
    }

    pub fn parent_field(&self) -> &FieldKey {
        &self.0.parent_field
    }

    pub fn parent_index(&self) -> usize {
        self.0.parent_index
    }

    /// Field path of a field of this node.
    pub fn field(&self, field: impl Into<FieldKey>) -> FieldPath {
        FieldPath::new(self.to_node_path(), field)
    }

    pub fn to_node_path(&self) -> NodePath {
        let mut steps = Vec::new();
        let mut current = Some(self);
        while let Some(path) = current {
            steps.push(PathStep {
                field: path.0.parent_field.clone(),
                index: path.0.parent_index,
            });
            current = path.0.parent.as_ref();
        }
        steps.reverse();
        steps
    }

    /// `None` for the empty (document root) path.
    pub fn from_node_path(path: &[PathStep]) -> Option<UpPath> {
        let (first, rest) = path.split_first()?;
        let root = UpPath::root(first.field.clone(), first.index);
        Some(
            rest.iter()
                .fold(root, |up, step| up.child(step.field.clone(), step.index)),
        )
    }
}

impl From<&UpPath> for NodePath {
    fn from(path: &UpPath) -> Self {
        path.to_node_path()
    }
}
