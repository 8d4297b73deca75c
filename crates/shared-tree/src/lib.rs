//! shared-tree — conflict resolution and synchronization for a collaborative
//! tree document.
//!
//! Sessions edit local branches optimistically, submit their commits to an
//! ordering service, and rebase over each other's commits as they come back
//! sequenced, so that every session converges on the same document.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`tree`] | Nodes, forests, paths, anchors |
//! | [`delta`] | Position-relative edits and the two-pass visitor |
//! | [`change`] | Changesets: apply, invert, rebase, compose, wire codec |
//! | [`edit_manager`] | The trunk, peer branches and local commit rebasing |
//! | [`branch`] | Forkable local views, transactions, constraints |
//! | [`shared_tree`] | [`SharedTree`], the per-session façade |

pub mod branch;
pub mod change;
pub mod delta;
pub mod edit_manager;
pub mod error;
pub mod events;
pub mod options;
pub mod shared_tree;
pub mod tree;

pub use branch::{BranchId, LocalCommit};
pub use change::{Changeset, Op};
pub use edit_manager::{RevisionTag, SessionId};
pub use error::{BranchError, ChangeError, EditManagerError, Error};
pub use events::{ChangeEvent, ChangeOrigin, DroppedCommit};
pub use options::SharedTreeOptions;
pub use shared_tree::{OutboundOp, SequencedOp, SharedTree};
pub use tree::{Anchor, FieldKey, FieldPath, Forest, TreeNode, TreeValue, UpPath};
