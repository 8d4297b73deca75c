//! Transactions: stacked groups of edits on one branch.
//!
//! Committing the outermost transaction squashes its edits into a single
//! commit (on the root branch, that commit is what gets submitted). Aborting
//! at any depth undoes the edits since the matching start, anchors included.

use tracing::debug;

use super::{BranchId, Branches, LocalCommit};
use crate::change::{map_path, Changeset, EditBuilder, Op};
use crate::edit_manager::Commit;
use crate::error::{BranchError, Error};
use crate::events::{ChangeEvent, ChangeOrigin};
use crate::tree::{Anchor, AnchorSet, TreeValue, UpPath};

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// Number of branch commits when the transaction started.
    pub start: usize,
    /// The branch's anchors when the transaction started.
    pub anchors: AnchorSet,
    /// Nodes this transaction constrained, tracked in the branch's anchors.
    pub constrained: Vec<Anchor>,
    /// Nodes whose value this transaction set.
    pub edited: Vec<Anchor>,
}

impl Frame {
    fn new(start: usize, anchors: AnchorSet) -> Self {
        Self {
            start,
            anchors,
            constrained: Vec::new(),
            edited: Vec::new(),
        }
    }

    /// Tracks the nodes whose value `change` sets. `anchors` must already
    /// reflect `change`.
    pub fn record(&mut self, change: &Changeset, anchors: &mut AnchorSet) {
        if change.is_dropped() {
            return;
        }
        for (i, op) in change.ops.iter().enumerate() {
            let Op::SetValue { path, .. } = op else {
                continue;
            };
            let after = change.ops[i + 1..]
                .iter()
                .try_fold(path.clone(), |path, later| map_path(later, &path));
            if let Some(path) = after {
                self.edited.push(anchors.track(&path));
            }
        }
    }

    fn claimed(&self) -> impl Iterator<Item = Anchor> + '_ {
        self.constrained.iter().chain(&self.edited).copied()
    }

    fn release(&self, anchors: &mut AnchorSet) {
        for anchor in self.claimed() {
            anchors.forget(anchor);
        }
    }
}

impl Branches {
    pub fn start_transaction(&mut self, id: BranchId) -> Result<(), Error> {
        let branch = self.live_mut(id)?;
        let frame = Frame::new(branch.commits.len(), branch.state.anchors.clone());
        branch.transactions.push(frame);
        Ok(())
    }

    pub fn transaction_depth(&self, id: BranchId) -> Result<usize, Error> {
        Ok(self.get(id)?.transactions.len())
    }

    pub fn is_in_transaction(&self, id: BranchId) -> Result<bool, Error> {
        Ok(self.transaction_depth(id)? > 0)
    }

    /// Closes the innermost transaction. Returns the commit to submit when
    /// the outermost transaction of the root branch closes.
    pub fn commit_transaction(&mut self, id: BranchId) -> Result<Vec<Commit>, Error> {
        let revision = self.mint_revision();
        let branch = self.live_mut(id)?;
        let frame = branch.transactions.pop().ok_or(BranchError::NoTransaction)?;
        if let Some(outer) = branch.transactions.last_mut() {
            outer.constrained.extend(frame.constrained);
            outer.edited.extend(frame.edited);
            return Ok(Vec::new());
        }
        frame.release(&mut branch.state.anchors);

        let group = branch.commits.split_off(frame.start);
        if group.is_empty() {
            return Ok(Vec::new());
        }
        let squashed = Changeset::squash(group.iter().map(|commit| &commit.change));
        if squashed.is_dropped() {
            debug!(edits = group.len(), "transaction dropped by a violated constraint");
            for commit in group.iter().rev() {
                branch.state.apply(&commit.inverse)?;
                branch.push_log(commit.inverse.clone());
            }
            self.events.push(ChangeEvent {
                branch: id,
                origin: ChangeOrigin::Local,
            });
            return Ok(Vec::new());
        }
        let inverse = Changeset::squash(group.iter().rev().map(|commit| &commit.inverse));
        branch.commits.push(LocalCommit {
            revision,
            change: squashed.clone(),
            inverse,
        });
        if id == BranchId::ROOT {
            Ok(vec![Commit {
                revision,
                change: squashed,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    /// Undoes every edit since the innermost transaction started.
    pub fn abort_transaction(&mut self, id: BranchId) -> Result<(), Error> {
        let branch = self.live_mut(id)?;
        let frame = branch.transactions.pop().ok_or(BranchError::NoTransaction)?;
        let group = branch.commits.split_off(frame.start);
        for commit in group.iter().rev() {
            branch.state.apply(&commit.inverse)?;
            branch.push_log(commit.inverse.clone());
        }
        branch.state.anchors.restore_missing(&frame.anchors);
        frame.release(&mut branch.state.anchors);
        debug!(edits = group.len(), "transaction aborted");
        self.events.push(ChangeEvent {
            branch: id,
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// Makes the open transaction conditional on the node at `path` holding
    /// `expected`. Only the first constraint per node counts, and nodes the
    /// transaction already edited are not constrained. Nodes are matched by
    /// identity, so edits that shift them in between do not matter.
    pub fn add_value_constraint(&mut self, id: BranchId, path: &UpPath, expected: TreeValue) -> Result<(), Error> {
        let node = path.to_node_path();
        let branch = self.live(id)?;
        if branch.transactions.is_empty() {
            return Err(BranchError::NoTransaction.into());
        }
        let anchors = &branch.state.anchors;
        if branch
            .transactions
            .iter()
            .flat_map(Frame::claimed)
            .any(|anchor| anchors.locate(anchor).as_ref() == Some(&node))
        {
            debug!("constraint ignored: node already constrained or edited");
            return Ok(());
        }
        let change = EditBuilder::new(&branch.state.forest).value_constraint(path, expected)?;
        self.apply_edit(id, change)?;
        let branch = self.live_mut(id)?;
        let anchor = branch.state.anchors.track(&node);
        if let Some(frame) = branch.transactions.last_mut() {
            frame.constrained.push(anchor);
        }
        Ok(())
    }
}
