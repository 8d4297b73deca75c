//! Two-pass traversal of a [`Root`].
//!
//! Every callback describes a change at a position that is valid once all
//! earlier callbacks have been applied, so visitors never compute offsets
//! themselves. Detaching has to be described bottom-up and attaching
//! top-down, and a moved-in subtree cannot be attached before it was moved
//! out, so the traversal runs in two passes:
//!
//! - The first pass performs inserts (top-down), move-outs (bottom-up) and
//!   value changes. Nested changes under a moved-out subtree that themselves
//!   contain moves or deletes are stashed by move id.
//! - The second pass performs move-ins (top-down) and deletes (bottom-up),
//!   and applies the stashed changes right after a single-node move-in.
//!   Multi-node move-ins are not recursed into.
//!
//! The second pass is skipped when the first found no moves or deletes.

use std::collections::HashMap;

use crate::delta::{FieldMarks, Mark, MarkList, Modify, MoveId, Root};
use crate::tree::{FieldKey, TreeNode, TreeValue};

/// Receives the changes of a delta, one position at a time.
pub trait DeltaVisitor {
    fn on_delete(&mut self, index: usize, count: usize);
    fn on_insert(&mut self, index: usize, content: &[TreeNode]);
    fn on_move_out(&mut self, index: usize, count: usize, id: MoveId);
    fn on_move_in(&mut self, index: usize, count: usize, id: MoveId);
    fn on_set_value(&mut self, value: &TreeValue);
    fn enter_node(&mut self, index: usize);
    fn exit_node(&mut self, index: usize);
    fn enter_field(&mut self, key: &FieldKey);
    fn exit_field(&mut self, key: &FieldKey);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Second,
}

struct PassConfig<'d> {
    pass: Pass,
    mods_to_moved_trees: HashMap<MoveId, &'d Modify>,
}

impl PassConfig<'_> {
    fn apply_value_changes(&self) -> bool {
        self.pass == Pass::First
    }
}

/// Crawls `delta`, calling `visitor` for each change.
pub fn visit_delta(delta: &Root, visitor: &mut dyn DeltaVisitor) {
    let mut config = PassConfig {
        pass: Pass::First,
        mods_to_moved_trees: HashMap::new(),
    };
    let contains_moves_or_deletes = visit_field_marks(delta, visitor, &mut config);
    if contains_moves_or_deletes {
        config.pass = Pass::Second;
        visit_field_marks(delta, visitor, &mut config);
    }
}

fn visit_field_marks<'d>(
    fields: &'d FieldMarks,
    visitor: &mut dyn DeltaVisitor,
    config: &mut PassConfig<'d>,
) -> bool {
    let mut contains_moves_or_deletes = false;
    for (key, marks) in fields {
        visitor.enter_field(key);
        let result = match config.pass {
            Pass::First => first_pass(marks, visitor, config),
            Pass::Second => second_pass(marks, visitor, config),
        };
        contains_moves_or_deletes |= result;
        visitor.exit_field(key);
    }
    contains_moves_or_deletes
}

fn visit_modify<'d>(
    index: usize,
    modify: &'d Modify,
    visitor: &mut dyn DeltaVisitor,
    config: &mut PassConfig<'d>,
) -> bool {
    let mut contains_moves_or_deletes = false;
    let value_change = modify
        .set_value
        .as_ref()
        .filter(|_| config.apply_value_changes());
    if value_change.is_some() || modify.fields.is_some() {
        visitor.enter_node(index);
        if let Some(value) = value_change {
            visitor.on_set_value(value);
        }
        if let Some(fields) = &modify.fields {
            contains_moves_or_deletes |= visit_field_marks(fields, visitor, config);
        }
        visitor.exit_node(index);
    }
    contains_moves_or_deletes
}

fn first_pass<'d>(
    marks: &'d MarkList,
    visitor: &mut dyn DeltaVisitor,
    config: &mut PassConfig<'d>,
) -> bool {
    let mut contains_moves_or_deletes = false;
    let mut index = 0;
    for mark in marks {
        let result = match mark {
            Mark::Skip(count) => {
                index += count;
                false
            }
            Mark::Delete { count, modify } => {
                // Deleted in the second pass.
                visit_modify(index, modify, visitor, config);
                index += count;
                true
            }
            Mark::MoveOut {
                count,
                move_id,
                modify,
            } => {
                let nested = visit_modify(index, modify, visitor, config);
                if nested {
                    config.mods_to_moved_trees.insert(*move_id, modify);
                }
                visitor.on_move_out(index, *count, *move_id);
                true
            }
            Mark::Modify(modify) => {
                let nested = visit_modify(index, modify, visitor, config);
                index += 1;
                nested
            }
            Mark::Insert { content, modify } => {
                visitor.on_insert(index, content);
                let nested = visit_modify(index, modify, visitor, config);
                index += content.len();
                nested
            }
            // Attached in the second pass.
            Mark::MoveIn { .. } => true,
        };
        contains_moves_or_deletes |= result;
    }
    contains_moves_or_deletes
}

fn second_pass<'d>(
    marks: &'d MarkList,
    visitor: &mut dyn DeltaVisitor,
    config: &mut PassConfig<'d>,
) -> bool {
    let mut index = 0;
    for mark in marks {
        match mark {
            Mark::Skip(count) => index += count,
            Mark::Delete { count, modify } => {
                visit_modify(index, modify, visitor, config);
                visitor.on_delete(index, *count);
            }
            Mark::MoveOut { .. } => {}
            Mark::Modify(modify) => {
                visit_modify(index, modify, visitor, config);
                index += 1;
            }
            Mark::Insert { content, .. } => index += content.len(),
            Mark::MoveIn { count, move_id } => {
                visitor.on_move_in(index, *count, *move_id);
                if *count == 1 {
                    if let Some(modify) = config.mods_to_moved_trees.get(move_id).copied() {
                        visit_modify(index, modify, visitor, config);
                    }
                }
                index += count;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{FieldMarksBuilder, Entry};
    use serde_json::json;

    /// Records callbacks as strings.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl DeltaVisitor for Recorder {
        fn on_delete(&mut self, index: usize, count: usize) {
            self.calls.push(format!("delete {index} {count}"));
        }
        fn on_insert(&mut self, index: usize, content: &[TreeNode]) {
            self.calls.push(format!("insert {index} {}", content.len()));
        }
        fn on_move_out(&mut self, index: usize, count: usize, id: MoveId) {
            self.calls.push(format!("moveOut {index} {count} {}", id.0));
        }
        fn on_move_in(&mut self, index: usize, count: usize, id: MoveId) {
            self.calls.push(format!("moveIn {index} {count} {}", id.0));
        }
        fn on_set_value(&mut self, value: &TreeValue) {
            self.calls.push(format!("setValue {value:?}"));
        }
        fn enter_node(&mut self, index: usize) {
            self.calls.push(format!("enterNode {index}"));
        }
        fn exit_node(&mut self, index: usize) {
            self.calls.push(format!("exitNode {index}"));
        }
        fn enter_field(&mut self, key: &FieldKey) {
            self.calls.push(format!("enterField {key}"));
        }
        fn exit_field(&mut self, key: &FieldKey) {
            self.calls.push(format!("exitField {key}"));
        }
    }

    fn visit(root: &Root) -> Vec<String> {
        let mut recorder = Recorder::default();
        visit_delta(root, &mut recorder);
        recorder.calls
    }

    fn field(marks: MarkList) -> Root {
        let mut root = Root::new();
        root.insert("foo".into(), marks);
        root
    }

    #[test]
    fn deletes_report_post_deletion_indices() {
        let root = field(vec![
            Mark::Delete {
                count: 1,
                modify: Modify::default(),
            },
            Mark::Skip(1),
            Mark::Delete {
                count: 1,
                modify: Modify::default(),
            },
        ]);
        assert_eq!(
            visit(&root),
            vec![
                "enterField foo",
                "exitField foo",
                "enterField foo",
                "delete 0 1",
                "delete 1 1",
                "exitField foo",
            ]
        );
    }

    #[test]
    fn insert_only_delta_takes_one_pass() {
        let root = field(vec![
            Mark::Skip(2),
            Mark::Insert {
                content: vec![TreeNode::leaf("Leaf", json!(1))],
                modify: Modify::default(),
            },
            Mark::Modify(Modify {
                set_value: Some(Some(json!("x"))),
                fields: None,
            }),
        ]);
        assert_eq!(
            visit(&root),
            vec![
                "enterField foo",
                "insert 2 1",
                "enterNode 3",
                "setValue Some(String(\"x\"))",
                "exitNode 3",
                "exitField foo",
            ]
        );
    }

    #[test]
    fn set_value_to_undefined_is_a_change() {
        let root = field(vec![Mark::Modify(Modify {
            set_value: Some(None),
            fields: None,
        })]);
        assert!(visit(&root).contains(&"setValue None".to_string()));
    }

    #[test]
    fn move_within_field() {
        // Move node 0 after node 2.
        let root = field(vec![
            Mark::MoveOut {
                count: 1,
                move_id: MoveId(7),
                modify: Modify::default(),
            },
            Mark::Skip(2),
            Mark::MoveIn {
                count: 1,
                move_id: MoveId(7),
            },
        ]);
        assert_eq!(
            visit(&root),
            vec![
                "enterField foo",
                "moveOut 0 1 7",
                "exitField foo",
                "enterField foo",
                "moveIn 2 1 7",
                "exitField foo",
            ]
        );
    }

    #[test]
    fn stashed_changes_apply_after_single_node_move_in() {
        let mut nested = FieldMarksBuilder::new();
        nested.push(
            "bar".into(),
            0,
            Entry::Detach(Mark::Delete {
                count: 1,
                modify: Modify::default(),
            }),
        );
        let root = field(vec![
            Mark::MoveOut {
                count: 1,
                move_id: MoveId(1),
                modify: Modify {
                    set_value: None,
                    fields: Some(nested.build()),
                },
            },
            Mark::Skip(1),
            Mark::MoveIn {
                count: 1,
                move_id: MoveId(1),
            },
        ]);
        assert_eq!(
            visit(&root),
            vec![
                "enterField foo",
                "enterNode 0",
                "enterField bar",
                "exitField bar",
                "exitNode 0",
                "moveOut 0 1 1",
                "exitField foo",
                "enterField foo",
                "moveIn 1 1 1",
                "enterNode 1",
                "enterField bar",
                "delete 0 1",
                "exitField bar",
                "exitNode 1",
                "exitField foo",
            ]
        );
    }
}
