//! Delta: the concrete, position-relative description of one edit, applied
//! to a tree through [`visit_delta`].
//!
//! # Overview
//!
//! A [`Root`] maps root field keys to [`MarkList`]s. Marks are positioned
//! implicitly: `Skip(n)` passes over `n` untouched nodes, the other marks
//! describe what happens at the current position. Positions are those of the
//! tree before the edit.
//!
//! Moves are a balanced pair: every [`Mark::MoveOut`] has exactly one
//! [`Mark::MoveIn`] with the same [`MoveId`] and count somewhere in the same
//! delta.

mod visit;

pub use visit::{visit_delta, DeltaVisitor};

use std::collections::BTreeMap;

use crate::tree::{FieldKey, TreeNode, TreeValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoveId(pub u64);

/// Changes to one node: its value and/or its fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modify {
    /// `Some(None)` sets the value to undefined; `None` leaves it alone.
    pub set_value: Option<TreeValue>,
    pub fields: Option<FieldMarks>,
}

impl Modify {
    pub fn is_empty(&self) -> bool {
        self.set_value.is_none() && self.fields.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    Skip(usize),
    Insert {
        content: Vec<TreeNode>,
        modify: Modify,
    },
    Delete {
        count: usize,
        modify: Modify,
    },
    MoveOut {
        count: usize,
        move_id: MoveId,
        modify: Modify,
    },
    MoveIn {
        count: usize,
        move_id: MoveId,
    },
    Modify(Modify),
}

pub type MarkList = Vec<Mark>;
pub type FieldMarks = BTreeMap<FieldKey, MarkList>;
pub type Root = FieldMarks;

/// Every `(move id, count)` of the move-outs and move-ins in `root`.
pub fn move_pairs(root: &Root) -> (Vec<(MoveId, usize)>, Vec<(MoveId, usize)>) {
    fn walk_fields(
        fields: &FieldMarks,
        outs: &mut Vec<(MoveId, usize)>,
        ins: &mut Vec<(MoveId, usize)>,
    ) {
        for marks in fields.values() {
            for mark in marks {
                match mark {
                    Mark::Skip(_) => {}
                    Mark::Insert { modify, .. }
                    | Mark::Delete { modify, .. }
                    | Mark::Modify(modify) => walk_modify(modify, outs, ins),
                    Mark::MoveOut {
                        count,
                        move_id,
                        modify,
                    } => {
                        outs.push((*move_id, *count));
                        walk_modify(modify, outs, ins);
                    }
                    Mark::MoveIn { count, move_id } => ins.push((*move_id, *count)),
                }
            }
        }
    }
    fn walk_modify(
        modify: &Modify,
        outs: &mut Vec<(MoveId, usize)>,
        ins: &mut Vec<(MoveId, usize)>,
    ) {
        if let Some(fields) = &modify.fields {
            walk_fields(fields, outs, ins);
        }
    }

    let mut outs = Vec::new();
    let mut ins = Vec::new();
    walk_fields(root, &mut outs, &mut ins);
    outs.sort();
    ins.sort();
    (outs, ins)
}

// ──────────────────────────────────────── Builder

/// One change at a position of a field, before being laid out as marks.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    /// Attach at a gap (between input nodes).
    Attach(Mark),
    /// Detach or modify the input nodes starting at an index.
    Detach(Mark),
    /// Nested changes under the input node at an index.
    Nested(FieldMarksBuilder),
    SetValue(TreeValue),
}

/// Collects positioned changes and lays them out as a [`Root`].
#[derive(Debug, Clone, Default)]
pub(crate) struct FieldMarksBuilder {
    fields: BTreeMap<FieldKey, Vec<(usize, Entry)>>,
}

impl FieldMarksBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds (creating as needed) the builder for the fields of the node at
    /// `path`.
    pub fn at_node(&mut self, path: &[crate::tree::PathStep]) -> &mut FieldMarksBuilder {
        let mut builder = self;
        for step in path {
            let entries = builder.fields.entry(step.field.clone()).or_default();
            let slot = entries
                .iter()
                .position(|(index, entry)| *index == step.index && matches!(entry, Entry::Nested(_)));
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    entries.push((step.index, Entry::Nested(FieldMarksBuilder::new())));
                    entries.len() - 1
                }
            };
            builder = match &mut entries[slot].1 {
                Entry::Nested(nested) => nested,
                Entry::Attach(_) | Entry::Detach(_) | Entry::SetValue(_) => unreachable!(),
            };
        }
        builder
    }

    pub fn push(&mut self, field: FieldKey, position: usize, entry: Entry) {
        self.fields.entry(field).or_default().push((position, entry));
    }

    pub fn build(self) -> FieldMarks {
        self.fields
            .into_iter()
            .map(|(key, entries)| (key, layout(entries)))
            .collect()
    }
}

/// Lays out positioned entries of one field as a mark list.
fn layout(mut entries: Vec<(usize, Entry)>) -> MarkList {
    // Attaches at a gap come before the node at the same index.
    entries.sort_by_key(|(position, entry)| (*position, !matches!(entry, Entry::Attach(_))));

    let mut marks = Vec::new();
    let mut cursor = 0;
    let mut entries = entries.into_iter().peekable();
    while let Some((position, entry)) = entries.next() {
        if position > cursor {
            marks.push(Mark::Skip(position - cursor));
            cursor = position;
        }
        match entry {
            Entry::Attach(mark) => marks.push(mark),
            Entry::Detach(mark) => {
                cursor += match &mark {
                    Mark::Delete { count, .. } | Mark::MoveOut { count, .. } => *count,
                    Mark::Modify(_) => 1,
                    Mark::Skip(_) | Mark::Insert { .. } | Mark::MoveIn { .. } => 0,
                };
                marks.push(mark);
            }
            Entry::Nested(_) | Entry::SetValue(_) => {
                // Merge every entry that modifies this same node.
                let mut modify = Modify::default();
                absorb(&mut modify, entry);
                while let Some((_, next)) = entries.next_if(|(p, e)| {
                    *p == position && matches!(e, Entry::Nested(_) | Entry::SetValue(_))
                }) {
                    absorb(&mut modify, next);
                }
                marks.push(Mark::Modify(modify));
                cursor += 1;
            }
        }
    }
    marks
}

fn absorb(modify: &mut Modify, entry: Entry) {
    match entry {
        Entry::Nested(nested) => {
            let fields = modify.fields.get_or_insert_with(BTreeMap::new);
            for (key, marks) in nested.build() {
                fields.insert(key, marks);
            }
        }
        Entry::SetValue(value) => modify.set_value = Some(value),
        Entry::Attach(_) | Entry::Detach(_) => {}
    }
}
