//! Rebasing: re-expressing a change so it applies after a concurrent one.
//!
//! Everything here works on input coordinates: a position is mapped through
//! an op by asking where the node (or gap) it names ends up once the op is
//! applied. Ties between two attaches at the same gap are broken by which
//! change is sequenced later: the later change's content goes first.
//!
//! Delete follows moved nodes: a node moved by a concurrent change is deleted
//! at its new location. A move rebased over a delete moves only the nodes
//! that survive the delete. A move rebased over a later move of the same
//! node leaves that node where the later move puts it.

use tracing::debug;

use super::{move_input_gap, Changeset, Op};
use crate::tree::{is_prefix, split_node_path, FieldPath, NodePath, PathStep};

/// Where a node of a field ends up after an op.
enum Placement {
    /// Still in the same field (whose own path may have changed).
    Stays(usize),
    Relocated(FieldPath, usize),
    Gone,
}

/// Maps the node at `index` of `field` through `op`. Only the index is
/// mapped; `field` is in the op's input coordinates.
fn place(op: &Op, field: &FieldPath, index: usize) -> Placement {
    match op {
        Op::SetValue { .. } | Op::Constraint { .. } => Placement::Stays(index),
        Op::Insert {
            field: target,
            index: at,
            content,
        } => {
            if target == field && index >= *at {
                Placement::Stays(index + content.len())
            } else {
                Placement::Stays(index)
            }
        }
        Op::Delete {
            field: target,
            index: at,
            count,
        } => {
            if target != field || index < *at {
                Placement::Stays(index)
            } else if index < at + count {
                Placement::Gone
            } else {
                Placement::Stays(index - count)
            }
        }
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            let mut index = index;
            if src == field {
                if index >= *src_index && index < src_index + count {
                    return match map_field(op, dst) {
                        Some(dst) => Placement::Relocated(dst, dst_index + (index - src_index)),
                        None => Placement::Gone,
                    };
                }
                if index >= src_index + count {
                    index -= count;
                }
            }
            if dst == field && index >= *dst_index {
                index += count;
            }
            Placement::Stays(index)
        }
    }
}

/// Path of the node at `path` once `op` is applied; `None` if the op removes
/// it.
pub fn map_path(op: &Op, path: &[PathStep]) -> Option<NodePath> {
    let mut input: NodePath = Vec::with_capacity(path.len());
    let mut output: NodePath = Vec::with_capacity(path.len());
    for step in path {
        let field = FieldPath {
            node: input.clone(),
            field: step.field.clone(),
        };
        match place(op, &field, step.index) {
            Placement::Stays(index) => output.push(PathStep {
                field: step.field.clone(),
                index,
            }),
            Placement::Relocated(dst, index) => output = dst.child(index),
            Placement::Gone => return None,
        }
        input.push(step.clone());
    }
    Some(output)
}

pub(crate) fn map_field(op: &Op, field: &FieldPath) -> Option<FieldPath> {
    let node = map_path(op, &field.node)?;
    Some(FieldPath {
        node,
        field: field.field.clone(),
    })
}

/// Gap after detaching `count` nodes at `at`.
fn collapse(gap: usize, at: usize, count: usize) -> usize {
    if gap <= at {
        gap
    } else if gap >= at + count {
        gap - count
    } else {
        at
    }
}

/// Gap after attaching `count` nodes at `at`. On a tie the gap stays before
/// the attached nodes when `keep_before` is set.
fn attach(gap: usize, at: usize, count: usize, keep_before: bool) -> usize {
    if gap < at || (gap == at && keep_before) {
        gap
    } else {
        gap + count
    }
}

/// Maps the gap before index `gap` of `field` through `op`. `None` when the
/// field's owner is removed.
fn map_gap(op: &Op, field: &FieldPath, gap: usize, gap_is_later: bool) -> Option<(FieldPath, usize)> {
    let mapped = map_field(op, field)?;
    let gap = match op {
        Op::SetValue { .. } | Op::Constraint { .. } => gap,
        Op::Insert {
            field: target,
            index,
            content,
        } if target == field => attach(gap, *index, content.len(), gap_is_later),
        Op::Delete {
            field: target,
            index,
            count,
        } if target == field => collapse(gap, *index, *count),
        Op::Insert { .. } | Op::Delete { .. } => gap,
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            let mut gap = gap;
            if src == field {
                gap = collapse(gap, *src_index, *count);
            }
            if dst == field {
                gap = attach(gap, *dst_index, *count, gap_is_later);
            }
            gap
        }
    };
    Some((mapped, gap))
}

fn moves_node(op: &Op, field: &FieldPath, index: usize) -> bool {
    matches!(
        op,
        Op::Move { src, src_index, count, .. }
            if src == field && index >= *src_index && index < src_index + count
    )
}

/// Deletes for the given nodes, bottom-up so that each delete leaves the
/// paths of the next ones intact. Descendants of deleted nodes are skipped.
fn delete_ops(mut paths: Vec<NodePath>) -> Vec<Op> {
    paths.sort();
    paths.dedup();
    let tops: Vec<&NodePath> = paths
        .iter()
        .filter(|path| {
            !paths
                .iter()
                .any(|other| other.len() < path.len() && is_prefix(other, path))
        })
        .collect();
    let mut runs: Vec<(FieldPath, usize, usize)> = Vec::new();
    for path in tops.into_iter().rev() {
        let Some((field, index)) = split_node_path(path) else {
            continue;
        };
        if let Some((last_field, start, count)) = runs.last_mut() {
            if *last_field == field && *start == index + 1 {
                *start = index;
                *count += 1;
                continue;
            }
        }
        runs.push((field, index, 1));
    }
    runs.into_iter()
        .map(|(field, index, count)| Op::Delete { field, index, count })
        .collect()
}

/// Field and first index when `sources` are consecutive siblings in order.
fn contiguous(sources: &[NodePath]) -> Option<(FieldPath, usize)> {
    let (field, start) = split_node_path(sources.first()?)?;
    for (offset, path) in sources.iter().enumerate().skip(1) {
        let (other, index) = split_node_path(path)?;
        if other != field || index != start + offset {
            return None;
        }
    }
    Some((field, start))
}

/// Moves that bring `sources`, in order, to the gap `gap` of `dst`.
fn emit_moves(sources: Vec<NodePath>, dst: FieldPath, gap: usize) -> Vec<Op> {
    if sources.is_empty() {
        return Vec::new();
    }
    if let Some((src, src_index)) = contiguous(&sources) {
        let count = sources.len();
        let dst_index = if src == dst {
            collapse(gap, src_index, count)
        } else {
            gap
        };
        return vec![Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        }];
    }

    // Scattered: one node at a time, each landing after the previous one.
    let mut ops = Vec::new();
    let mut remaining = sources;
    let mut dst = dst;
    let mut gap = gap;
    while !remaining.is_empty() {
        let path = remaining.remove(0);
        let Some((src, src_index)) = split_node_path(&path) else {
            continue;
        };
        let dst_index = if src == dst {
            collapse(gap, src_index, 1)
        } else {
            gap
        };
        let op = Op::Move {
            src,
            src_index,
            count: 1,
            dst: dst.clone(),
            dst_index,
        };
        match map_gap(&op, &dst, gap, false) {
            Some((next_dst, next_gap)) => {
                dst = next_dst;
                gap = next_gap;
            }
            None => break,
        }
        remaining = remaining
            .iter()
            .filter_map(|path| map_path(&op, path))
            .collect();
        ops.push(op);
    }
    ops
}

/// `a` re-expressed to apply after `b`, both written against the same tree.
fn transform_op(a: &Op, b: &Op, a_later: bool) -> Vec<Op> {
    match a {
        Op::SetValue { path, value } => {
            if let Op::SetValue { path: other, .. } = b {
                // The later of two writes to the same node wins.
                if other == path && !a_later {
                    return Vec::new();
                }
            }
            map_path(b, path)
                .map(|path| Op::SetValue {
                    path,
                    value: value.clone(),
                })
                .into_iter()
                .collect()
        }
        Op::Constraint { path: None, .. } => vec![a.clone()],
        Op::Constraint {
            path: Some(path),
            expected,
            violated,
        } => {
            let Some(mapped) = map_path(b, path) else {
                return vec![Op::Constraint {
                    path: None,
                    expected: expected.clone(),
                    violated: true,
                }];
            };
            let violated = match b {
                Op::SetValue { path: other, value } if other == path && a_later => value != expected,
                _ => *violated,
            };
            vec![Op::Constraint {
                path: Some(mapped),
                expected: expected.clone(),
                violated,
            }]
        }
        Op::Insert {
            field,
            index,
            content,
        } => map_gap(b, field, *index, a_later)
            .map(|(field, index)| Op::Insert {
                field,
                index,
                content: content.clone(),
            })
            .into_iter()
            .collect(),
        Op::Delete {
            field,
            index,
            count,
        } => delete_ops(
            (0..*count)
                .filter_map(|offset| map_path(b, &field.child(index + offset)))
                .collect(),
        ),
        Op::Move {
            src,
            src_index,
            count,
            dst,
            dst_index,
        } => {
            let gap = move_input_gap(src, *src_index, *count, dst, *dst_index);
            let Some((dst, gap)) = map_gap(b, dst, gap, a_later) else {
                return Vec::new();
            };
            let sources: Vec<NodePath> = (*src_index..src_index + count)
                .filter(|index| a_later || !moves_node(b, src, *index))
                .filter_map(|index| map_path(b, &src.child(index)))
                .collect();
            if sources.iter().any(|source| is_prefix(source, &dst.node)) {
                return Vec::new();
            }
            emit_moves(sources, dst, gap)
        }
    }
}

/// Transforms two op lists written against the same tree over each other:
/// returns `a` after `b` and `b` after `a`.
fn transform_lists(a: &[Op], b: &[Op], a_later: bool) -> (Vec<Op>, Vec<Op>) {
    match (a, b) {
        ([], _) => (Vec::new(), b.to_vec()),
        (_, []) => (a.to_vec(), Vec::new()),
        ([x], [y]) => (transform_op(x, y, a_later), transform_op(y, x, !a_later)),
        ([_], [y, rest @ ..]) => {
            let (a1, y1) = transform_lists(a, std::slice::from_ref(y), a_later);
            let (a2, rest1) = transform_lists(&a1, rest, a_later);
            (a2, [y1, rest1].concat())
        }
        ([x, rest @ ..], _) => {
            let (x1, b1) = transform_lists(std::slice::from_ref(x), b, a_later);
            let (rest1, b2) = transform_lists(rest, &b1, a_later);
            ([x1, rest1].concat(), b2)
        }
    }
}

/// `change` rebased over `over`, both based on the same state.
/// `change_is_later` says which of the two is sequenced second.
pub fn rebase(change: &Changeset, over: &Changeset, change_is_later: bool) -> Changeset {
    if over.is_dropped() || over.is_empty() || change.is_empty() {
        return change.clone();
    }
    Changeset::new(transform_lists(&change.ops, &over.ops, change_is_later).0)
}

/// Rebases a branch of commits over a concurrent change sequenced before
/// them. Returns the rebased commits and the concurrent change expressed
/// after the original commits.
pub fn rebase_branch(commits: &[Changeset], over: &Changeset) -> (Vec<Changeset>, Changeset) {
    let mut over = over.clone();
    let rebased = commits
        .iter()
        .map(|commit| {
            let rebased = rebase(commit, &over, true);
            if rebased.is_dropped() != commit.is_dropped() {
                debug!(dropped = rebased.is_dropped(), "constraint status changed by rebase");
            }
            over = rebase(&over, commit, false);
            rebased
        })
        .collect();
    (rebased, over)
}
