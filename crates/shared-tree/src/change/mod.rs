//! Changesets: the abstract, rebasable form of an edit.
//!
//! # Overview
//!
//! A [`Changeset`] is a list of primitive [`Op`]s applied in order, each
//! expressed in the coordinates of the tree left by the ops before it.
//! Changesets are what travel on the wire, sit in the trunk and get rebased;
//! a [`crate::delta::Root`] is derived from each op only to apply it.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `apply` | Applying to a [`crate::tree::TreeState`], inverse capture, delta derivation |
//! | `rebase` | Position mapping, op transforms, branch rebasing |
//! | `builder` | [`EditBuilder`], ops validated against a forest |
//! | `codec` | [`ChangeCodec`], the JSON wire form |
//!
//! # Constraints
//!
//! [`Op::Constraint`] carries a precondition on a node's value. A changeset
//! with a violated constraint is *dropped*: applying it does nothing and
//! rebasing anything over it is the identity. Its ops are still transformed
//! when it is rebased, so a later change can satisfy the constraint again.

mod apply;
mod builder;
mod codec;
mod rebase;

pub use apply::op_delta;
pub use builder::EditBuilder;
pub use codec::ChangeCodec;
pub use rebase::{map_path, rebase, rebase_branch};

use serde::{Deserialize, Serialize};

use crate::tree::{value_repr, FieldPath, NodePath, TreeNode, TreeValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Op {
    SetValue {
        path: NodePath,
        #[serde(default, with = "value_repr")]
        value: TreeValue,
    },
    Insert {
        field: FieldPath,
        index: usize,
        content: Vec<TreeNode>,
    },
    Delete {
        field: FieldPath,
        index: usize,
        count: usize,
    },
    /// Moves `count` nodes starting at `src_index` of `src`. `dst` is given
    /// in the coordinates before the move; `dst_index` is the index in `dst`
    /// once the moved nodes are detached.
    Move {
        src: FieldPath,
        src_index: usize,
        count: usize,
        dst: FieldPath,
        dst_index: usize,
    },
    /// `path` is `None` once the constrained node was removed.
    Constraint {
        path: Option<NodePath>,
        #[serde(default, with = "value_repr")]
        expected: TreeValue,
        violated: bool,
    },
}

impl Op {
    pub fn is_structural(&self) -> bool {
        matches!(self, Op::Insert { .. } | Op::Delete { .. } | Op::Move { .. })
    }

    /// Root fields whose content this op can change.
    pub fn root_fields(&self) -> Vec<&crate::tree::FieldKey> {
        fn root_of_field(field: &FieldPath) -> &crate::tree::FieldKey {
            field.node.first().map(|step| &step.field).unwrap_or(&field.field)
        }
        match self {
            Op::SetValue { path, .. } => path.first().map(|step| &step.field).into_iter().collect(),
            Op::Insert { field, .. } | Op::Delete { field, .. } => vec![root_of_field(field)],
            Op::Move { src, dst, .. } => vec![root_of_field(src), root_of_field(dst)],
            Op::Constraint { .. } => Vec::new(),
        }
    }
}

/// Gap in `dst` before the nodes are detached.
pub(crate) fn move_input_gap(src: &FieldPath, src_index: usize, count: usize, dst: &FieldPath, dst_index: usize) -> usize {
    if src == dst && dst_index > src_index {
        dst_index + count
    } else {
        dst_index
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub ops: Vec<Op>,
}

impl Changeset {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// `true` when a constraint of this change is violated, in which case
    /// the change has no effect.
    pub fn is_dropped(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::Constraint { violated: true, .. }))
    }

    pub fn has_constraints(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Constraint { .. }))
    }

    /// Squashes the changes of a transaction into one, constraints included:
    /// a violation anywhere drops the whole group.
    pub fn squash<'a>(changes: impl IntoIterator<Item = &'a Changeset>) -> Changeset {
        Changeset {
            ops: changes
                .into_iter()
                .flat_map(|change| change.ops.iter().cloned())
                .collect(),
        }
    }

    /// Net effect of a sequence of changes: dropped changes contribute
    /// nothing and constraints are gone.
    pub fn compose<'a>(changes: impl IntoIterator<Item = &'a Changeset>) -> Changeset {
        Changeset {
            ops: changes
                .into_iter()
                .filter(|change| !change.is_dropped())
                .flat_map(|change| change.ops.iter())
                .filter(|op| !matches!(op, Op::Constraint { .. }))
                .cloned()
                .collect(),
        }
    }
}

impl From<Op> for Changeset {
    fn from(op: Op) -> Self {
        Changeset { ops: vec![op] }
    }
}
