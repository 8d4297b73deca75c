//! [`SharedTree`]: one session's replica of a collaborative tree.
//!
//! # Overview
//!
//! Local edits are applied to a branch right away. Edits on the root branch
//! are also queued as [`OutboundOp`]s for the ordering service; the service
//! broadcasts them back to every session as [`SequencedOp`]s, which are fed
//! to [`SharedTree::process_sequenced`] in sequence order.
//!
//! Besides the branches, the tree keeps the *sequenced* view: the document
//! as the trunk tip describes it. Summaries are taken from that view, and
//! the inverses of this session's sequenced commits are kept against it so
//! they can be reverted later.

mod ops;
mod revert;
mod summary;

pub use ops::{OutboundOp, SequencedOp};
pub use summary::{CONTENT_BLOB, EDIT_MANAGER_BLOB, HANDLE_KEY};

use std::collections::{BTreeSet, VecDeque};

use shared_tree_summarizer::{
    submit_summary, CreateChildSource, GcData, RefreshSummaryResult, SnapshotTree, SubmitSummaryOptions,
    SubmitSummaryResult, SummarizerError, SummarizerNode, SummaryObject, SummaryStorage, SummaryTree,
};
use tracing::debug;

use crate::branch::{BranchId, Branches};
use crate::change::{rebase, ChangeCodec, Changeset, EditBuilder};
use crate::edit_manager::{Commit, EditManager, RevisionTag, SequencedOutcome, SessionId};
use crate::error::{ChangeError, Error};
use crate::events::{ChangeEvent, DroppedCommit};
use crate::options::SharedTreeOptions;
use crate::tree::{Anchor, FieldKey, FieldPath, Forest, TreeNode, TreeState, TreeValue, UpPath};
use summary::{parse_snapshot, TreeSummarySource};

#[derive(Debug)]
pub struct SharedTree {
    session: SessionId,
    options: SharedTreeOptions,
    edit_manager: EditManager,
    sequenced: TreeState,
    branches: Branches,
    outbound: Vec<OutboundOp>,
    /// Inverses of this session's sequenced commits, based on the trunk tip.
    revertibles: VecDeque<(RevisionTag, Changeset)>,
    summarizer: SummarizerNode,
    last_summary_handle: Option<String>,
}

impl SharedTree {
    /// An empty document.
    pub fn new(session: SessionId, options: SharedTreeOptions) -> Self {
        let summarizer = SummarizerNode::new_root(options.summarizer.clone(), 0);
        Self {
            session,
            edit_manager: EditManager::new(session),
            sequenced: TreeState::default(),
            branches: Branches::new(session, Forest::new()),
            outbound: Vec::new(),
            revertibles: VecDeque::new(),
            summarizer,
            last_summary_handle: None,
            options,
        }
    }

    /// Joins a document from the snapshot of the summary taken at
    /// `reference_sequence_number`.
    pub fn load(
        session: SessionId,
        options: SharedTreeOptions,
        snapshot: &SnapshotTree,
        reference_sequence_number: u64,
    ) -> Result<Self, Error> {
        let (edit_manager, fields) = parse_snapshot(snapshot)?;
        let mut summarizer =
            SummarizerNode::from_snapshot(options.summarizer.clone(), reference_sequence_number, snapshot);
        for key in fields.keys() {
            summarizer.create_child(key.as_str(), CreateChildSource::FromSummary)?;
        }
        let forest = Forest::from_fields(fields);
        debug!(%session, reference_sequence_number, "loaded from snapshot");
        Ok(Self {
            session,
            edit_manager: EditManager::from_snapshot(session, edit_manager),
            sequenced: TreeState::new(forest.clone()),
            branches: Branches::new(session, forest),
            outbound: Vec::new(),
            revertibles: VecDeque::new(),
            summarizer,
            last_summary_handle: None,
            options,
        })
    }

    // ──────────────────────────────────────── Accessors

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn edit_manager(&self) -> &EditManager {
        &self.edit_manager
    }

    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    /// The root branch's view: the sequenced document plus this session's
    /// unacknowledged edits.
    pub fn forest(&self) -> &Forest {
        self.branches
            .forest(BranchId::ROOT)
            .unwrap_or(&self.sequenced.forest)
    }

    pub fn branch_forest(&self, branch: BranchId) -> Result<&Forest, Error> {
        Ok(self.branches.forest(branch)?)
    }

    /// The document at the trunk tip.
    pub fn sequenced_forest(&self) -> &Forest {
        &self.sequenced.forest
    }

    pub fn summarizer(&self) -> &SummarizerNode {
        &self.summarizer
    }

    /// Ops submitted since the last call, in submission order.
    pub fn take_outbound(&mut self) -> Vec<OutboundOp> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        self.branches.take_events()
    }

    /// Local commits that rebasing emptied since the last call.
    pub fn take_dropped_commits(&mut self) -> Vec<DroppedCommit> {
        self.branches.take_dropped_commits()
    }

    // ──────────────────────────────────────── Editing

    /// Builds a change against the branch's current view and applies it.
    pub fn edit<F>(&mut self, branch: BranchId, build: F) -> Result<(), Error>
    where
        F: FnOnce(&EditBuilder<'_>) -> Result<Changeset, ChangeError>,
    {
        let change = build(&EditBuilder::new(self.branches.forest(branch)?))?;
        self.apply_change(branch, change)
    }

    /// Applies an already built change to a branch.
    pub fn apply_change(&mut self, branch: BranchId, change: Changeset) -> Result<(), Error> {
        let commits = self.branches.apply_edit(branch, change)?;
        self.submit(commits)
    }

    pub fn set_value(&mut self, branch: BranchId, path: &UpPath, value: TreeValue) -> Result<(), Error> {
        self.edit(branch, |builder| builder.set_value(path, value))
    }

    pub fn insert(&mut self, branch: BranchId, field: &FieldPath, index: usize, content: Vec<TreeNode>) -> Result<(), Error> {
        self.edit(branch, |builder| builder.insert(field, index, content))
    }

    pub fn delete(&mut self, branch: BranchId, field: &FieldPath, index: usize, count: usize) -> Result<(), Error> {
        self.edit(branch, |builder| builder.delete(field, index, count))
    }

    pub fn move_nodes(
        &mut self,
        branch: BranchId,
        src: &FieldPath,
        src_index: usize,
        count: usize,
        dst: &FieldPath,
        dst_index: usize,
    ) -> Result<(), Error> {
        self.edit(branch, |builder| builder.move_nodes(src, src_index, count, dst, dst_index))
    }

    fn submit(&mut self, commits: Vec<Commit>) -> Result<(), Error> {
        for commit in commits {
            let contents = ChangeCodec::encode(&commit.change)?;
            let revision = commit.revision;
            let edit_number = self.edit_manager.add_local_change(commit);
            self.outbound.push(OutboundOp {
                session: self.session,
                edit_number,
                revision,
                reference_sequence_number: self.edit_manager.last_sequence_number(),
                contents,
            });
        }
        Ok(())
    }

    // ──────────────────────────────────────── Branches

    pub fn fork(&mut self, branch: BranchId) -> Result<BranchId, Error> {
        self.branches.fork(branch)
    }

    pub fn pull(&mut self, branch: BranchId) -> Result<(), Error> {
        self.branches.pull(branch)
    }

    pub fn merge(&mut self, branch: BranchId) -> Result<(), Error> {
        let commits = self.branches.merge(branch)?;
        self.submit(commits)
    }

    pub fn is_merged(&self, branch: BranchId) -> Result<bool, Error> {
        Ok(self.branches.is_merged(branch)?)
    }

    pub fn start_transaction(&mut self, branch: BranchId) -> Result<(), Error> {
        self.branches.start_transaction(branch)
    }

    pub fn commit_transaction(&mut self, branch: BranchId) -> Result<(), Error> {
        let commits = self.branches.commit_transaction(branch)?;
        self.submit(commits)
    }

    pub fn abort_transaction(&mut self, branch: BranchId) -> Result<(), Error> {
        self.branches.abort_transaction(branch)
    }

    pub fn add_value_constraint(&mut self, branch: BranchId, path: &UpPath, expected: TreeValue) -> Result<(), Error> {
        self.branches.add_value_constraint(branch, path, expected)
    }

    pub fn track(&mut self, branch: BranchId, path: &UpPath) -> Result<Anchor, Error> {
        self.branches.track(branch, path)
    }

    pub fn locate(&self, branch: BranchId, anchor: Anchor) -> Result<Option<UpPath>, Error> {
        Ok(self.branches.locate(branch, anchor)?)
    }

    pub fn forget(&mut self, branch: BranchId, anchor: Anchor) -> Result<(), Error> {
        Ok(self.branches.forget(branch, anchor)?)
    }

    // ──────────────────────────────────────── Sequenced ops

    /// Processes the next op of the sequenced stream.
    ///
    /// A commit whose trunk version does not apply to the sequenced view
    /// breaks the shared order every session relies on. It is rejected with
    /// [`crate::error::EditManagerError::InvalidSequencedChange`] and nothing
    /// is recorded; the session should not process further ops.
    pub fn process_sequenced(&mut self, op: SequencedOp) -> Result<(), Error> {
        let change = ChangeCodec::decode(&op.contents)?;
        let sequenced = &mut self.sequenced;
        let mut inverse = Changeset::empty();
        let outcome = self.edit_manager.add_sequenced_change_checked(
            op.revision,
            op.edit_number,
            change,
            op.sequence_number,
            op.reference_sequence_number,
            |trunk_change| {
                inverse = sequenced.apply(trunk_change)?;
                Ok(())
            },
        )?;

        let trunk_change = match outcome {
            SequencedOutcome::Acknowledged { commit } => {
                self.branches.acknowledge_root_head();
                self.rebase_revertibles(&commit.change);
                if !inverse.is_empty() {
                    self.revertibles.push_back((commit.revision, inverse));
                    while self.revertibles.len() > self.options.max_revertibles {
                        self.revertibles.pop_front();
                    }
                }
                commit.change
            }
            SequencedOutcome::Remote { trunk_change, net } => {
                self.rebase_revertibles(&trunk_change);
                let submitted = self
                    .edit_manager
                    .local_changes()
                    .iter()
                    .map(|commit| commit.change.clone())
                    .collect();
                self.branches
                    .rebase_root(submitted, &trunk_change, &net, &self.sequenced.forest)?;
                trunk_change
            }
        };

        self.record_sequenced_change(&trunk_change, op.sequence_number)?;
        self.advance_minimum_sequence_number(op.minimum_sequence_number);
        Ok(())
    }

    /// Lets the edit manager forget history every session has seen.
    pub fn advance_minimum_sequence_number(&mut self, minimum_sequence_number: u64) {
        self.edit_manager
            .advance_minimum_sequence_number(minimum_sequence_number);
    }

    fn rebase_revertibles(&mut self, over: &Changeset) {
        for (_, inverse) in self.revertibles.iter_mut() {
            *inverse = rebase(inverse, over, true);
        }
    }

    /// Marks the summarizer nodes of the root fields `change` touched.
    fn record_sequenced_change(&mut self, change: &Changeset, sequence_number: u64) -> Result<(), Error> {
        self.summarizer.record_change(sequence_number);
        if change.is_dropped() {
            return Ok(());
        }
        let touched: BTreeSet<&FieldKey> = change.ops.iter().flat_map(|op| op.root_fields()).collect();
        for key in touched {
            match self.summarizer.child_mut(key.as_str()) {
                Some(child) => child.record_change(sequence_number),
                None => {
                    self.summarizer
                        .create_child(key.as_str(), CreateChildSource::FromAttach { sequence_number })?;
                }
            }
        }
        Ok(())
    }

    // ──────────────────────────────────────── Summaries

    /// Summary of the sequenced document, not tracked by the summarizer.
    pub fn create_summary(&mut self, full_tree: bool) -> Result<SummaryTree, Error> {
        let mut source = TreeSummarySource {
            edit_manager: &self.edit_manager,
            forest: &self.sequenced.forest,
        };
        let result = self.summarizer.summarize(full_tree, false, &mut source)?;
        match result.summary {
            SummaryObject::Tree(tree) => Ok(tree),
            _ => Err(SummarizerError::NodeNotSummarized.into()),
        }
    }

    /// Runs one summary attempt at the last sequence number, referencing the
    /// last acknowledged summary for unchanged fields.
    pub fn submit_summary(
        &mut self,
        storage: &mut dyn SummaryStorage,
        options: &SubmitSummaryOptions,
    ) -> SubmitSummaryResult {
        let mut source = TreeSummarySource {
            edit_manager: &self.edit_manager,
            forest: &self.sequenced.forest,
        };
        submit_summary(
            &mut self.summarizer,
            &mut source,
            storage,
            self.edit_manager.last_sequence_number(),
            self.last_summary_handle.as_deref(),
            options,
        )
    }

    /// Handles the acknowledgement of the summary uploaded as `handle` at
    /// `summary_reference_sequence_number`.
    pub fn process_summary_ack<F>(
        &mut self,
        handle: &str,
        summary_reference_sequence_number: u64,
        fetch_snapshot: F,
    ) -> Result<RefreshSummaryResult, Error>
    where
        F: FnOnce() -> Result<SnapshotTree, SummarizerError>,
    {
        let result = self.summarizer.refresh_latest_summary(
            Some(handle),
            summary_reference_sequence_number,
            fetch_snapshot,
        )?;
        if result.latest_summary_updated {
            self.last_summary_handle = Some(handle.to_string());
        }
        Ok(result)
    }

    pub fn get_gc_data(&mut self, full_gc: bool) -> Result<GcData, Error> {
        let mut source = TreeSummarySource {
            edit_manager: &self.edit_manager,
            forest: &self.sequenced.forest,
        };
        Ok(self.summarizer.get_gc_data(full_gc, &mut source)?)
    }
}
