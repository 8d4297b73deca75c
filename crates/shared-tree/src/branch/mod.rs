//! Branches: local, forkable views of the document.
//!
//! All branches of a session live in one arena owned by [`Branches`]; the
//! root branch ([`BranchId::ROOT`]) is the session's view of the document
//! and the only one whose commits are submitted.
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`Branches::fork`] | New child branch with a copy of the parent's view |
//! | [`Branches::pull`] | Rebases the branch's commits over what the parent gained since the fork point |
//! | [`Branches::merge`] | Pulls, then replays the branch's commits on the parent; the branch is disposed |
//! | [`Branches::apply_edit`] | Applies a change as a new commit |
//!
//! Each branch keeps the changes applied to its view in a log, starting at
//! the oldest fork point of its children. A pull composes the parent's log
//! past the child's fork point into the upstream change.

mod transaction;

pub(crate) use transaction::Frame;

use tracing::{debug, error, warn};

use crate::change::{rebase_branch, Changeset};
use crate::edit_manager::{Commit, RevisionTag, SessionId};
use crate::error::{BranchError, ChangeError, Error};
use crate::events::{ChangeEvent, ChangeOrigin, DroppedCommit};
use crate::tree::{Anchor, Forest, TreeState, UpPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId(usize);

impl BranchId {
    pub const ROOT: BranchId = BranchId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// A change applied on a branch together with the change undoing it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCommit {
    pub revision: RevisionTag,
    pub change: Changeset,
    pub inverse: Changeset,
}

#[derive(Debug, Clone)]
pub(crate) struct Branch {
    parent: Option<BranchId>,
    children: Vec<BranchId>,
    /// Fork point: absolute position in the parent's log.
    base: usize,
    pub commits: Vec<LocalCommit>,
    log: Vec<Changeset>,
    log_offset: usize,
    pub state: TreeState,
    pub transactions: Vec<Frame>,
    merged: bool,
}

impl Branch {
    fn new(parent: Option<BranchId>, base: usize, state: TreeState) -> Self {
        Self {
            parent,
            children: Vec::new(),
            base,
            commits: Vec::new(),
            log: Vec::new(),
            log_offset: 0,
            state,
            transactions: Vec::new(),
            merged: false,
        }
    }

    fn log_end(&self) -> usize {
        self.log_offset + self.log.len()
    }

    /// Records a change applied to this branch's view.
    pub fn push_log(&mut self, change: Changeset) {
        if self.children.is_empty() {
            self.log_offset = self.log_end() + 1;
            self.log.clear();
        } else {
            self.log.push(change);
        }
    }

    fn apply_commit(&mut self, revision: RevisionTag, change: Changeset) -> Result<(), ChangeError> {
        let inverse = self.state.apply(&change)?;
        if let Some(frame) = self.transactions.last_mut() {
            frame.record(&change, &mut self.state.anchors);
        }
        self.push_log(change.clone());
        self.commits.push(LocalCommit {
            revision,
            change,
            inverse,
        });
        Ok(())
    }

    /// Moves the view from `base + commits` to `target + new`, where `net` is
    /// `upstream` rebased over the old commits and `target` is the base after
    /// `upstream`. Returns the revisions of commits that no longer apply, or
    /// were dropped by a constraint, after the rebase.
    ///
    /// Applying `net` is tried first. When that does not reproduce the
    /// expected view, the old commits are undone and the new ones replayed.
    /// If neither reaches the expected view the branch is left unchanged.
    fn rebase_onto(
        &mut self,
        new: Vec<Changeset>,
        upstream: &Changeset,
        net: &Changeset,
        target: &Forest,
    ) -> Result<Vec<RevisionTag>, BranchError> {
        let mut expected = TreeState::new(target.clone());
        let mut rebased = Vec::with_capacity(new.len());
        let mut dropped = Vec::new();
        for (old, change) in self.commits.iter().zip(new) {
            let (change, inverse) = match expected.apply(&change) {
                Ok(inverse) => {
                    if change.is_dropped() && !old.change.is_dropped() {
                        debug!(revision = %old.revision, "rebased commit dropped by a constraint");
                        dropped.push(old.revision);
                    }
                    (change, inverse)
                }
                Err(err) => {
                    warn!(revision = %old.revision, %err, "rebased commit no longer applies; dropping it");
                    dropped.push(old.revision);
                    (Changeset::empty(), Changeset::empty())
                }
            };
            rebased.push(LocalCommit {
                revision: old.revision,
                change,
                inverse,
            });
        }

        let mut state = self.state.clone();
        match state.apply(net) {
            Ok(_) if state.forest == expected.forest => {
                self.state = state;
                self.push_log(net.clone());
                self.commits = rebased;
                return Ok(dropped);
            }
            Ok(_) => debug!("net change diverges from the rebased commits; replaying"),
            Err(err) => debug!(%err, "net change does not apply; replaying"),
        }

        let mut state = self.state.clone();
        let steps: Vec<Changeset> = self
            .commits
            .iter()
            .rev()
            .map(|commit| commit.inverse.clone())
            .chain(std::iter::once(upstream.clone()))
            .chain(rebased.iter().map(|commit| commit.change.clone()))
            .collect();
        for step in &steps {
            if let Err(err) = state.apply(step) {
                error!(%err, "replay failed");
                return Err(BranchError::RebaseDiverged);
            }
        }
        if state.forest != expected.forest {
            error!("replayed view diverges from the rebased commits");
            return Err(BranchError::RebaseDiverged);
        }
        self.state = state;
        for step in steps {
            self.push_log(step);
        }
        self.commits = rebased;
        Ok(dropped)
    }
}

/// Every branch of one session.
#[derive(Debug, Clone)]
pub struct Branches {
    session: SessionId,
    next_local: u64,
    branches: Vec<Branch>,
    pub(crate) events: Vec<ChangeEvent>,
    dropped: Vec<DroppedCommit>,
}

impl Branches {
    pub fn new(session: SessionId, forest: Forest) -> Self {
        Self {
            session,
            next_local: 0,
            branches: vec![Branch::new(None, 0, TreeState::new(forest))],
            events: Vec::new(),
            dropped: Vec::new(),
        }
    }

    pub(crate) fn mint_revision(&mut self) -> RevisionTag {
        let local = self.next_local;
        self.next_local += 1;
        RevisionTag {
            session: self.session,
            local,
        }
    }

    pub(crate) fn get(&self, id: BranchId) -> Result<&Branch, BranchError> {
        self.branches.get(id.0).ok_or(BranchError::UnknownBranch(id.0))
    }

    fn get_mut(&mut self, id: BranchId) -> Result<&mut Branch, BranchError> {
        self.branches.get_mut(id.0).ok_or(BranchError::UnknownBranch(id.0))
    }

    /// A branch that may still be edited.
    pub(crate) fn live(&self, id: BranchId) -> Result<&Branch, BranchError> {
        let branch = self.get(id)?;
        if branch.merged {
            return Err(BranchError::AlreadyMerged);
        }
        Ok(branch)
    }

    pub(crate) fn live_mut(&mut self, id: BranchId) -> Result<&mut Branch, BranchError> {
        let branch = self.get_mut(id)?;
        if branch.merged {
            return Err(BranchError::AlreadyMerged);
        }
        Ok(branch)
    }

    pub fn is_merged(&self, id: BranchId) -> Result<bool, BranchError> {
        Ok(self.get(id)?.merged)
    }

    pub fn parent(&self, id: BranchId) -> Result<Option<BranchId>, BranchError> {
        Ok(self.get(id)?.parent)
    }

    pub fn forest(&self, id: BranchId) -> Result<&Forest, BranchError> {
        Ok(&self.get(id)?.state.forest)
    }

    pub fn state(&self, id: BranchId) -> Result<&TreeState, BranchError> {
        Ok(&self.get(id)?.state)
    }

    /// Commits of the branch not yet in its parent (for the root: not yet
    /// sequenced), oldest first.
    pub fn commits(&self, id: BranchId) -> Result<&[LocalCommit], BranchError> {
        Ok(&self.get(id)?.commits)
    }

    // ──────────────────────────────────────── Branching

    pub fn fork(&mut self, id: BranchId) -> Result<BranchId, Error> {
        let parent = self.live(id)?;
        let child = Branch::new(Some(id), parent.log_end(), parent.state.clone());
        let child_id = BranchId(self.branches.len());
        self.branches.push(child);
        self.get_mut(id)?.children.push(child_id);
        debug!(parent = id.0, child = child_id.0, "branch forked");
        Ok(child_id)
    }

    /// Rebases the branch onto the parent's current view.
    pub fn pull(&mut self, id: BranchId) -> Result<(), Error> {
        let branch = self.live(id)?;
        if !branch.transactions.is_empty() {
            return Err(BranchError::TransactionInProgress.into());
        }
        let Some(parent_id) = branch.parent else {
            return Ok(());
        };
        let parent = self.get(parent_id)?;
        let end = parent.log_end();
        if branch.base == end {
            return Ok(());
        }
        let upstream = Changeset::compose(&parent.log[branch.base - parent.log_offset..]);
        let target = parent.state.forest.clone();
        let old: Vec<Changeset> = branch.commits.iter().map(|commit| commit.change.clone()).collect();
        let (new, net) = rebase_branch(&old, &upstream);

        let branch = self.get_mut(id)?;
        let dropped = branch.rebase_onto(new, &upstream, &net, &target)?;
        branch.base = end;
        self.record_dropped(id, dropped);
        self.trim_log(parent_id)?;
        self.events.push(ChangeEvent {
            branch: id,
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    /// Applies the branch's commits to its parent and disposes of the branch
    /// (and its descendants). Returns the commits to submit, if any.
    pub fn merge(&mut self, id: BranchId) -> Result<Vec<Commit>, Error> {
        let branch = self.live(id)?;
        if !branch.transactions.is_empty() {
            return Err(BranchError::MergeDuringTransaction.into());
        }
        let Some(parent_id) = branch.parent else {
            return Err(BranchError::MergeRoot.into());
        };
        self.live(parent_id)?;
        self.pull(id)?;

        let commits = std::mem::take(&mut self.get_mut(id)?.commits);
        let submit = parent_id == BranchId::ROOT && self.get(parent_id)?.transactions.is_empty();
        let mut submitted = Vec::new();
        let mut applied = 0;
        for commit in commits {
            if commit.change.is_empty() || commit.change.is_dropped() {
                continue;
            }
            self.get_mut(parent_id)?
                .apply_commit(commit.revision, commit.change.clone())?;
            applied += 1;
            if submit {
                submitted.push(Commit {
                    revision: commit.revision,
                    change: commit.change,
                });
            }
        }

        self.dispose(id);
        let parent = self.get_mut(parent_id)?;
        parent.children.retain(|child| *child != id);
        self.trim_log(parent_id)?;
        if applied > 0 {
            self.events.push(ChangeEvent {
                branch: parent_id,
                origin: ChangeOrigin::Local,
            });
        }
        debug!(branch = id.0, parent = parent_id.0, applied, "branch merged");
        Ok(submitted)
    }

    fn dispose(&mut self, id: BranchId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(branch) = self.branches.get_mut(next.0) {
                branch.merged = true;
                branch.log.clear();
                stack.append(&mut branch.children);
            }
        }
    }

    /// Drops log entries every child has pulled past.
    fn trim_log(&mut self, id: BranchId) -> Result<(), BranchError> {
        let branch = self.get(id)?;
        let oldest = branch
            .children
            .iter()
            .filter_map(|child| self.branches.get(child.0))
            .map(|child| child.base)
            .min()
            .unwrap_or(branch.log_end());
        let branch = self.get_mut(id)?;
        let trimmed = oldest.saturating_sub(branch.log_offset).min(branch.log.len());
        branch.log.drain(..trimmed);
        branch.log_offset += trimmed;
        Ok(())
    }

    // ──────────────────────────────────────── Editing

    /// Applies `change` as a new commit on the branch. Returns the commits to
    /// submit: the new one when `id` is the root outside a transaction.
    pub fn apply_edit(&mut self, id: BranchId, change: Changeset) -> Result<Vec<Commit>, Error> {
        self.live(id)?;
        let revision = self.mint_revision();
        let branch = self.live_mut(id)?;
        branch.apply_commit(revision, change.clone())?;
        let submit = id == BranchId::ROOT && branch.transactions.is_empty();
        self.events.push(ChangeEvent {
            branch: id,
            origin: ChangeOrigin::Local,
        });
        Ok(if submit {
            vec![Commit { revision, change }]
        } else {
            Vec::new()
        })
    }

    // ──────────────────────────────────────── Anchors

    pub fn track(&mut self, id: BranchId, path: &UpPath) -> Result<Anchor, Error> {
        let branch = self.live_mut(id)?;
        let node = path.to_node_path();
        if branch.state.forest.node(&node).is_none() {
            return Err(ChangeError::MissingNode(node).into());
        }
        Ok(branch.state.anchors.track(&node))
    }

    /// Current location of a tracked node; `None` once it was deleted.
    pub fn locate(&self, id: BranchId, anchor: Anchor) -> Result<Option<UpPath>, BranchError> {
        let anchors = &self.get(id)?.state.anchors;
        Ok(anchors
            .locate(anchor)
            .and_then(|path| UpPath::from_node_path(&path)))
    }

    pub fn forget(&mut self, id: BranchId, anchor: Anchor) -> Result<(), BranchError> {
        self.get_mut(id)?.state.anchors.forget(anchor);
        Ok(())
    }

    // ──────────────────────────────────────── Root branch

    /// Removes the oldest root commit once the service sequenced it.
    pub(crate) fn acknowledge_root_head(&mut self) -> Option<LocalCommit> {
        let root = self.branches.get_mut(BranchId::ROOT.0)?;
        if root.commits.is_empty() {
            return None;
        }
        for frame in &mut root.transactions {
            frame.start = frame.start.saturating_sub(1);
        }
        Some(root.commits.remove(0))
    }

    /// Rebases the root branch over a peer commit. `submitted` are the
    /// submitted commits already rebased by the edit manager and `net` the
    /// trunk change rebased over them; commits staged in an open transaction
    /// follow the submitted ones. `sequenced` is the trunk view after
    /// `upstream`.
    pub(crate) fn rebase_root(
        &mut self,
        submitted: Vec<Changeset>,
        upstream: &Changeset,
        net: &Changeset,
        sequenced: &Forest,
    ) -> Result<(), BranchError> {
        let root = self.get_mut(BranchId::ROOT)?;
        let staged: Vec<Changeset> = root.commits[submitted.len().min(root.commits.len())..]
            .iter()
            .map(|commit| commit.change.clone())
            .collect();
        let (staged, net) = rebase_branch(&staged, net);
        let mut new = submitted;
        new.extend(staged);
        let dropped = root.rebase_onto(new, upstream, &net, sequenced)?;
        self.record_dropped(BranchId::ROOT, dropped);
        self.events.push(ChangeEvent {
            branch: BranchId::ROOT,
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    fn record_dropped(&mut self, branch: BranchId, revisions: Vec<RevisionTag>) {
        self.dropped.extend(
            revisions
                .into_iter()
                .map(|revision| DroppedCommit { branch, revision }),
        );
    }

    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Local commits emptied by rebases since the last call.
    pub fn take_dropped_commits(&mut self) -> Vec<DroppedCommit> {
        std::mem::take(&mut self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Op;
    use crate::tree::{FieldPath, TreeNode};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn values(forest: &Forest) -> String {
        forest
            .root_field(&"s".into())
            .iter()
            .filter_map(|node| node.value.as_ref().and_then(|v| v.as_str().map(str::to_owned)))
            .collect()
    }

    fn branches(content: &str) -> Branches {
        let nodes = content
            .chars()
            .map(|c| TreeNode::leaf("Leaf", json!(c.to_string())))
            .collect();
        Branches::new(SessionId::from_raw(1), Forest::from_fields(BTreeMap::from([("s".into(), nodes)])))
    }

    fn branches_forest(content: &str) -> Forest {
        branches(content).forest(BranchId::ROOT).unwrap().clone()
    }

    fn insert(index: usize, v: &str) -> Changeset {
        Op::Insert {
            field: FieldPath::root("s"),
            index,
            content: vec![TreeNode::leaf("Leaf", json!(v))],
        }
        .into()
    }

    fn delete(index: usize, count: usize) -> Changeset {
        Op::Delete {
            field: FieldPath::root("s"),
            index,
            count,
        }
        .into()
    }

    #[test]
    fn fork_is_isolated_until_merged() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let fork = branches.fork(root).unwrap();
        assert!(branches.apply_edit(fork, insert(3, "d")).unwrap().is_empty());
        assert_eq!(values(branches.forest(root).unwrap()), "abc");
        assert_eq!(values(branches.forest(fork).unwrap()), "abcd");

        let submitted = branches.merge(fork).unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(values(branches.forest(root).unwrap()), "abcd");
        assert!(branches.is_merged(fork).unwrap());
    }

    #[test]
    fn pull_rebases_branch_commits() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let fork = branches.fork(root).unwrap();
        branches.apply_edit(fork, insert(1, "x")).unwrap();
        branches.apply_edit(root, delete(0, 1)).unwrap();
        branches.apply_edit(root, insert(2, "y")).unwrap();

        branches.pull(fork).unwrap();
        assert_eq!(values(branches.forest(fork).unwrap()), "xbcy");
        branches.merge(fork).unwrap();
        assert_eq!(values(branches.forest(root).unwrap()), "xbcy");
    }

    #[test]
    fn pull_drops_commits_whose_target_is_gone() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let fork = branches.fork(root).unwrap();
        let set = Op::SetValue {
            path: FieldPath::root("s").child(1),
            value: Some(json!("B")),
        };
        branches.apply_edit(fork, set.into()).unwrap();
        branches.apply_edit(root, delete(1, 1)).unwrap();
        branches.pull(fork).unwrap();
        assert_eq!(values(branches.forest(fork).unwrap()), "ac");
        assert!(branches.commits(fork).unwrap()[0].change.is_empty());
        // Losing to a concurrent delete is ordinary conflict resolution.
        assert!(branches.take_dropped_commits().is_empty());
    }

    #[test]
    fn pull_reports_commits_dropped_by_constraints() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let fork = branches.fork(root).unwrap();
        branches.start_transaction(fork).unwrap();
        branches
            .add_value_constraint(fork, &UpPath::root("s", 0), Some(json!("a")))
            .unwrap();
        branches.apply_edit(fork, insert(3, "d")).unwrap();
        branches.commit_transaction(fork).unwrap();
        let revision = branches.commits(fork).unwrap()[0].revision;

        let set = Op::SetValue {
            path: FieldPath::root("s").child(0),
            value: Some(json!("A")),
        };
        branches.apply_edit(root, set.into()).unwrap();
        branches.pull(fork).unwrap();
        assert_eq!(values(branches.forest(fork).unwrap()), "Abc");
        assert_eq!(
            branches.take_dropped_commits(),
            vec![DroppedCommit { branch: fork, revision }]
        );
        assert!(branches.take_dropped_commits().is_empty());
    }

    #[test]
    fn diverging_rebase_leaves_the_branch_alone() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let anchor = branches.track(root, &UpPath::root("s", 1)).unwrap();
        let fork = branches.fork(root).unwrap();
        let branch = branches.get_mut(root).unwrap();
        let log_end = branch.log_end();
        // The target does not match what the upstream change produces.
        let target = branches_forest("yabc");
        let upstream = insert(0, "x");
        let result = branch.rebase_onto(Vec::new(), &upstream, &upstream, &target);
        assert_eq!(result, Err(BranchError::RebaseDiverged));
        assert_eq!(values(&branch.state.forest), "abc");
        assert_eq!(branch.log_end(), log_end);
        assert_eq!(branches.locate(root, anchor).unwrap(), Some(UpPath::root("s", 1)));
        branches.pull(fork).unwrap();
        assert_eq!(values(branches.forest(fork).unwrap()), "abc");
    }

    #[test]
    fn merged_branch_rejects_everything() {
        let mut branches = branches("a");
        let fork = branches.fork(BranchId::ROOT).unwrap();
        let nested = branches.fork(fork).unwrap();
        branches.merge(fork).unwrap();
        for id in [fork, nested] {
            assert_eq!(branches.pull(id), Err(Error::Branch(BranchError::AlreadyMerged)));
            assert_eq!(branches.merge(id), Err(Error::Branch(BranchError::AlreadyMerged)));
            assert_eq!(
                branches.apply_edit(id, insert(0, "z")),
                Err(Error::Branch(BranchError::AlreadyMerged))
            );
        }
    }

    #[test]
    fn pull_and_merge_refuse_open_transactions() {
        let mut branches = branches("a");
        let fork = branches.fork(BranchId::ROOT).unwrap();
        branches.start_transaction(fork).unwrap();
        assert_eq!(
            branches.pull(fork).unwrap_err().to_string(),
            "Branch may not be pulled while transaction is in progress"
        );
        assert_eq!(
            branches.merge(fork).unwrap_err().to_string(),
            "Branch may not be merged while transaction is in progress"
        );
        assert_eq!(branches.merge(BranchId::ROOT), Err(Error::Branch(BranchError::MergeRoot)));
    }

    #[test]
    fn nested_forks_merge_up() {
        let mut branches = branches("ab");
        let root = BranchId::ROOT;
        let outer = branches.fork(root).unwrap();
        let inner = branches.fork(outer).unwrap();
        branches.apply_edit(inner, insert(2, "c")).unwrap();
        branches.apply_edit(outer, insert(0, "0")).unwrap();
        assert!(branches.merge(inner).unwrap().is_empty());
        assert_eq!(values(branches.forest(outer).unwrap()), "0abc");
        assert_eq!(values(branches.forest(root).unwrap()), "ab");
        assert_eq!(branches.merge(outer).unwrap().len(), 2);
        assert_eq!(values(branches.forest(root).unwrap()), "0abc");
    }

    #[test]
    fn log_is_trimmed_to_the_oldest_fork_point() {
        let mut branches = branches("a");
        let root = BranchId::ROOT;
        branches.apply_edit(root, insert(0, "x")).unwrap();
        assert!(branches.get(root).unwrap().log.is_empty());
        let fork = branches.fork(root).unwrap();
        branches.apply_edit(root, insert(0, "y")).unwrap();
        assert_eq!(branches.get(root).unwrap().log.len(), 1);
        branches.pull(fork).unwrap();
        assert!(branches.get(root).unwrap().log.is_empty());
        assert_eq!(values(branches.forest(fork).unwrap()), "yxa");
    }

    #[test]
    fn anchors_follow_pulls() {
        let mut branches = branches("abc");
        let root = BranchId::ROOT;
        let fork = branches.fork(root).unwrap();
        let anchor = branches.track(fork, &UpPath::root("s", 2)).unwrap();
        branches.apply_edit(root, delete(0, 1)).unwrap();
        branches.pull(fork).unwrap();
        assert_eq!(branches.locate(fork, anchor).unwrap(), Some(UpPath::root("s", 1)));
        assert!(branches.track(fork, &UpPath::root("s", 7)).is_err());
    }
}
