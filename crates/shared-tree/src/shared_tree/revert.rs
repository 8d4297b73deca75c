use tracing::debug;

use super::SharedTree;
use crate::branch::BranchId;
use crate::change::rebase;
use crate::edit_manager::RevisionTag;
use crate::error::Error;

impl SharedTree {
    /// Undoes a commit of this session by applying its inverse, rebased over
    /// everything that happened since, as a new edit on the root branch.
    ///
    /// Sequenced commits stay revertible while they are among the last
    /// `max_revertibles` ones.
    pub fn revert(&mut self, revision: RevisionTag) -> Result<(), Error> {
        let commits = self.branches.commits(BranchId::ROOT)?;
        let inverse = if let Some((_, inverse)) = self.revertibles.iter().find(|(tag, _)| *tag == revision) {
            commits
                .iter()
                .fold(inverse.clone(), |inverse, commit| rebase(&inverse, &commit.change, true))
        } else if let Some(position) = commits.iter().position(|commit| commit.revision == revision) {
            commits[position + 1..]
                .iter()
                .fold(commits[position].inverse.clone(), |inverse, commit| {
                    rebase(&inverse, &commit.change, true)
                })
        } else {
            return Err(Error::RevisionNotFound(revision));
        };
        debug!(%revision, ops = inverse.ops.len(), "reverting");
        if inverse.is_empty() {
            return Ok(());
        }
        self.apply_change(BranchId::ROOT, inverse)
    }
}
