use tracing::error;

use super::builder::validate_op;
use super::rebase::{map_field, map_path};
use super::{move_input_gap, Changeset, Op};
use crate::delta::{Entry, FieldMarksBuilder, Mark, Modify, MoveId, Root};
use crate::error::ChangeError;
use crate::tree::{split_node_path, FieldPath, Forest, TreeState};

/// The delta that applies `op`. Constraints have an empty delta.
pub fn op_delta(op: &Op) -> Root {
    let mut builder = FieldMarksBuilder::new();
    match op {
        Op::SetValue { path, value } => {
            if let Some((field, index)) = split_node_path(path) {
                builder
                    .at_node(&field.node)
                    .push(field.field, index, Entry::SetValue(value.clone()));
            }
        }
        Op::Insert {
            field,
            index,
            content,
        } => builder.at_node(&field.node).push(
            field.field.clone(),
            *index,
            Entry::Attach(Mark::Insert {
                content: content.clone(),
                modify: Modify::default(),
            }),
        ),
        Op::Delete {
            field,
            index,
            count,
        } => builder.at_node(&field.node).push(
            field.field.clone(),
            *index,
            Entry::Detach(Mark::Delete {
                count: *count,
                modify: Modify::default(),
            }),
        ),
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            let move_id = MoveId(0);
            builder.at_node(&src.node).push(
                src.field.clone(),
                *src_index,
                Entry::Detach(Mark::MoveOut {
                    count: *count,
                    move_id,
                    modify: Modify::default(),
                }),
            );
            builder.at_node(&dst.node).push(
                dst.field.clone(),
                move_input_gap(src, *src_index, *count, dst, *dst_index),
                Entry::Attach(Mark::MoveIn {
                    count: *count,
                    move_id,
                }),
            );
        }
        Op::Constraint { .. } => {}
    }
    builder.build()
}

impl Changeset {
    /// One delta per op, in order.
    pub fn deltas(&self) -> Vec<Root> {
        self.ops.iter().map(op_delta).collect()
    }
}

/// The op undoing `op` on `forest`, captured before `op` is applied.
fn invert_op(forest: &Forest, op: &Op) -> Result<Option<Op>, ChangeError> {
    let inverse = match op {
        Op::SetValue { path, .. } => {
            let old = forest
                .value(path)
                .ok_or_else(|| ChangeError::MissingNode(path.clone()))?;
            Op::SetValue {
                path: path.clone(),
                value: old.clone(),
            }
        }
        Op::Insert {
            field,
            index,
            content,
        } => Op::Delete {
            field: field.clone(),
            index: *index,
            count: content.len(),
        },
        Op::Delete {
            field,
            index,
            count,
        } => {
            let nodes = forest
                .field(field)
                .and_then(|nodes| nodes.get(*index..index.checked_add(*count)?))
                .ok_or_else(|| ChangeError::MissingField(field.clone()))?;
            Op::Insert {
                field: field.clone(),
                index: *index,
                content: nodes.to_vec(),
            }
        }
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            let unreachable = || ChangeError::Apply("moved nodes cannot be located".into());
            let landed = map_field(op, dst).ok_or_else(unreachable)?;
            let origin = map_path(op, &src.node).ok_or_else(unreachable)?;
            Op::Move {
                src: landed,
                src_index: *dst_index,
                count: *count,
                dst: FieldPath {
                    node: origin,
                    field: src.field.clone(),
                },
                dst_index: *src_index,
            }
        }
        Op::Constraint { .. } => return Ok(None),
    };
    Ok(Some(inverse))
}

impl TreeState {
    /// Applies `change` and returns its inverse. A dropped change does
    /// nothing. On error the state is left as it was.
    pub fn apply(&mut self, change: &Changeset) -> Result<Changeset, ChangeError> {
        if change.is_dropped() {
            return Ok(Changeset::empty());
        }
        let mut inverse = Vec::with_capacity(change.ops.len());
        for op in &change.ops {
            match self.apply_op(op) {
                Ok(Some(undo)) => inverse.push(undo),
                Ok(None) => {}
                Err(err) => {
                    for undo in inverse.iter().rev() {
                        if let Err(rollback) = self.apply_op(undo) {
                            error!(%rollback, "rolling back a partially applied change failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        inverse.reverse();
        Ok(Changeset::new(inverse))
    }

    fn apply_op(&mut self, op: &Op) -> Result<Option<Op>, ChangeError> {
        validate_op(&self.forest, op)?;
        let inverse = invert_op(&self.forest, op)?;
        if !matches!(op, Op::Constraint { .. }) {
            self.apply_delta(&op_delta(op)).map_err(ChangeError::Apply)?;
        }
        Ok(inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::move_pairs;
    use crate::tree::{PathStep, TreeNode};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn leaf(v: &str) -> TreeNode {
        TreeNode::leaf("Leaf", json!(v))
    }

    fn state() -> TreeState {
        let parent = TreeNode::new("Node").with_field("kids", vec![leaf("x"), leaf("y")]);
        TreeState::new(Forest::from_fields(BTreeMap::from([
            ("a".into(), vec![leaf("1"), parent, leaf("3")]),
            ("b".into(), vec![leaf("4")]),
        ])))
    }

    fn round_trip(op: Op) {
        let mut state = state();
        let before = state.clone();
        let inverse = state.apply(&op.clone().into()).unwrap();
        assert_ne!(state.forest, before.forest, "{op:?} had no effect");
        state.apply(&inverse).unwrap();
        assert_eq!(state.forest, before.forest, "inverse of {op:?}");
    }

    #[test]
    fn inverses_restore_the_forest() {
        round_trip(Op::SetValue {
            path: vec![PathStep::new("a", 0)],
            value: None,
        });
        round_trip(Op::Insert {
            field: FieldPath::new(vec![PathStep::new("a", 1)], "kids"),
            index: 1,
            content: vec![leaf("z")],
        });
        round_trip(Op::Delete {
            field: FieldPath::root("a"),
            index: 1,
            count: 2,
        });
        round_trip(Op::Move {
            src: FieldPath::root("a"),
            src_index: 0,
            count: 1,
            dst: FieldPath::root("a"),
            dst_index: 2,
        });
        // Into a node whose index shifts once the source is detached.
        round_trip(Op::Move {
            src: FieldPath::root("a"),
            src_index: 0,
            count: 1,
            dst: FieldPath::new(vec![PathStep::new("a", 1)], "kids"),
            dst_index: 2,
        });
        round_trip(Op::Move {
            src: FieldPath::new(vec![PathStep::new("a", 1)], "kids"),
            src_index: 0,
            count: 2,
            dst: FieldPath::root("b"),
            dst_index: 1,
        });
    }

    #[test]
    fn move_into_shifted_sibling_lands_inside_it() {
        let mut state = state();
        state
            .apply(
                &Op::Move {
                    src: FieldPath::root("a"),
                    src_index: 0,
                    count: 1,
                    dst: FieldPath::new(vec![PathStep::new("a", 1)], "kids"),
                    dst_index: 0,
                }
                .into(),
            )
            .unwrap();
        let parent = state.forest.node(&[PathStep::new("a", 0)]).unwrap();
        let kids: Vec<_> = parent.field(&"kids".into()).iter().map(|n| n.value.clone()).collect();
        assert_eq!(kids, vec![Some(json!("1")), Some(json!("x")), Some(json!("y"))]);
    }

    #[test]
    fn failed_change_leaves_state_untouched() {
        let mut state = state();
        let before = state.clone();
        let change = Changeset::new(vec![
            Op::Delete {
                field: FieldPath::root("b"),
                index: 0,
                count: 1,
            },
            Op::Delete {
                field: FieldPath::root("b"),
                index: 0,
                count: 1,
            },
        ]);
        assert!(matches!(state.apply(&change), Err(ChangeError::OutOfBounds { .. })));
        assert_eq!(state, before);
    }

    #[test]
    fn anchors_follow_applied_moves() {
        let mut state = state();
        let anchor = state.anchors.track(&[PathStep::new("a", 1), PathStep::new("kids", 1)]);
        state
            .apply(
                &Op::Move {
                    src: FieldPath::new(vec![PathStep::new("a", 1)], "kids"),
                    src_index: 1,
                    count: 1,
                    dst: FieldPath::root("b"),
                    dst_index: 0,
                }
                .into(),
            )
            .unwrap();
        assert_eq!(state.anchors.locate(anchor), Some(vec![PathStep::new("b", 0)]));
    }

    #[test]
    fn move_deltas_are_balanced() {
        let op = Op::Move {
            src: FieldPath::root("a"),
            src_index: 0,
            count: 2,
            dst: FieldPath::root("b"),
            dst_index: 1,
        };
        let (outs, ins) = move_pairs(&op_delta(&op));
        assert_eq!(outs, ins);
        assert_eq!(outs.len(), 1);
    }
}
