use crate::branch::BranchId;
use crate::edit_manager::RevisionTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// The content of a branch changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub branch: BranchId,
    pub origin: ChangeOrigin,
}

/// A local commit that stopped applying after a rebase, or whose constraint
/// no longer held, and was emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedCommit {
    pub branch: BranchId,
    pub revision: RevisionTag,
}
