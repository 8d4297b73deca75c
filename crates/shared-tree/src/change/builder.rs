use super::{Changeset, Op};
use crate::error::ChangeError;
use crate::tree::{is_prefix, FieldPath, Forest, NodePath, TreeNode, TreeValue, UpPath};

/// Turns edit intents addressed by path into changesets, checking them
/// against the forest they will be applied to.
#[derive(Debug, Clone, Copy)]
pub struct EditBuilder<'a> {
    forest: &'a Forest,
}

impl<'a> EditBuilder<'a> {
    pub fn new(forest: &'a Forest) -> Self {
        Self { forest }
    }

    pub fn set_value(&self, path: &UpPath, value: TreeValue) -> Result<Changeset, ChangeError> {
        self.build(Op::SetValue {
            path: path.to_node_path(),
            value,
        })
    }

    pub fn insert(
        &self,
        field: &FieldPath,
        index: usize,
        content: Vec<TreeNode>,
    ) -> Result<Changeset, ChangeError> {
        self.build(Op::Insert {
            field: field.clone(),
            index,
            content,
        })
    }

    pub fn delete(&self, field: &FieldPath, index: usize, count: usize) -> Result<Changeset, ChangeError> {
        self.build(Op::Delete {
            field: field.clone(),
            index,
            count,
        })
    }

    /// Moves `count` nodes of `src` so that they start at `dst_index` of
    /// `dst` once detached.
    pub fn move_nodes(
        &self,
        src: &FieldPath,
        src_index: usize,
        count: usize,
        dst: &FieldPath,
        dst_index: usize,
    ) -> Result<Changeset, ChangeError> {
        self.build(Op::Move {
            src: src.clone(),
            src_index,
            count,
            dst: dst.clone(),
            dst_index,
        })
    }

    /// Precondition that the node at `path` holds `expected`, evaluated now.
    pub fn value_constraint(&self, path: &UpPath, expected: TreeValue) -> Result<Changeset, ChangeError> {
        let path = path.to_node_path();
        let current = self
            .forest
            .value(&path)
            .ok_or_else(|| ChangeError::MissingNode(path.clone()))?;
        let violated = *current != expected;
        Ok(Op::Constraint {
            path: Some(path),
            expected,
            violated,
        }
        .into())
    }

    fn build(&self, op: Op) -> Result<Changeset, ChangeError> {
        validate_op(self.forest, &op)?;
        Ok(op.into())
    }
}

fn field_len(forest: &Forest, field: &FieldPath) -> Result<usize, ChangeError> {
    forest
        .field(field)
        .map(<[TreeNode]>::len)
        .ok_or_else(|| ChangeError::MissingField(field.clone()))
}

fn check_range(forest: &Forest, field: &FieldPath, index: usize, count: usize, len_delta: usize) -> Result<(), ChangeError> {
    let len = field_len(forest, field)?.saturating_sub(len_delta);
    if index.checked_add(count).map_or(true, |end| end > len) {
        return Err(ChangeError::OutOfBounds {
            field: field.clone(),
            index,
            count,
            len,
        });
    }
    Ok(())
}

fn check_node(forest: &Forest, path: &NodePath) -> Result<(), ChangeError> {
    if path.is_empty() || forest.node(path).is_none() {
        return Err(ChangeError::MissingNode(path.clone()));
    }
    Ok(())
}

/// Checks that `op` can be applied to `forest`.
pub(crate) fn validate_op(forest: &Forest, op: &Op) -> Result<(), ChangeError> {
    match op {
        Op::SetValue { path, .. } => check_node(forest, path),
        Op::Insert { field, index, .. } => check_range(forest, field, *index, 0, 0),
        Op::Delete {
            field,
            index,
            count,
        } => check_range(forest, field, *index, *count, 0),
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            check_range(forest, src, *src_index, *count, 0)?;
            if (*src_index..src_index + count).any(|index| is_prefix(&src.child(index), &dst.node)) {
                return Err(ChangeError::MoveIntoSelf);
            }
            let detached = if src == dst { *count } else { 0 };
            check_range(forest, dst, *dst_index, 0, detached)
        }
        Op::Constraint { .. } => Ok(()),
    }
}
