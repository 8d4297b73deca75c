use shared_tree_summarizer::SummarizerError;
use thiserror::Error;

use crate::edit_manager::{RevisionTag, SessionId};
use crate::tree::{display_path, FieldPath, NodePath};

/// An edit that does not fit the tree it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("no node at {}", display_path(.0))]
    MissingNode(NodePath),
    #[error("no node owns field {0}")]
    MissingField(FieldPath),
    #[error("{count} nodes at {index} are out of bounds for field {field} of length {len}")]
    OutOfBounds {
        field: FieldPath,
        index: usize,
        count: usize,
        len: usize,
    },
    #[error("cannot move nodes into their own subtree")]
    MoveIntoSelf,
    #[error("delta could not be applied: {0}")]
    Apply(String),
    #[error("change decode failed: {0}")]
    Decode(String),
}

/// Violations of the sequencing protocol. These are fatal for the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditManagerError {
    #[error("edit {found} from session {session} is out of order, expected {expected}")]
    OutOfOrderEdit {
        session: SessionId,
        expected: u64,
        found: u64,
    },
    #[error("acknowledged revision {found} does not match the oldest local revision {expected:?}")]
    AckMismatch {
        expected: Option<RevisionTag>,
        found: RevisionTag,
    },
    #[error("sequence number {found} does not follow {last}")]
    OutOfOrderSequence { last: u64, found: u64 },
    #[error("reference sequence number {reference_sequence_number} is older than the trunk base {trunk_base}")]
    StaleReference {
        reference_sequence_number: u64,
        trunk_base: u64,
    },
    #[error("sequenced commit {sequence_number} does not apply to the trunk: {error}")]
    InvalidSequencedChange {
        sequence_number: u64,
        error: ChangeError,
    },
    #[error("edit manager snapshot is malformed: {0}")]
    Snapshot(String),
    #[error(transparent)]
    Change(#[from] ChangeError),
}

/// Misuse of the branch API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchError {
    #[error("Branch is already merged")]
    AlreadyMerged,
    #[error("Branch may not be pulled while transaction is in progress")]
    TransactionInProgress,
    #[error("Branch may not be merged while transaction is in progress")]
    MergeDuringTransaction,
    #[error("No transaction is currently in progress")]
    NoTransaction,
    #[error("the root branch cannot be merged")]
    MergeRoot,
    #[error("unknown branch {0}")]
    UnknownBranch(usize),
    #[error("unknown anchor")]
    UnknownAnchor,
    #[error("rebased branch does not reproduce the upstream view")]
    RebaseDiverged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Change(#[from] ChangeError),
    #[error(transparent)]
    EditManager(#[from] EditManagerError),
    #[error(transparent)]
    Branch(#[from] BranchError),
    #[error("summarizer: {0}")]
    Summarizer(#[from] SummarizerError),
    #[error("revision {0} is not a commit of this session")]
    RevisionNotFound(RevisionTag),
}
