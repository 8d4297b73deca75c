use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::change::Changeset;

/// Identity of a collaborating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Random session id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        SessionId(rng.gen_range(1..=i64::MAX as u64))
    }

    pub const fn from_raw(id: u64) -> Self {
        SessionId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Session-unique name of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionTag {
    pub session: SessionId,
    pub local: u64,
}

impl fmt::Display for RevisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.local)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: RevisionTag,
    pub change: Changeset,
}

impl Commit {
    pub fn session(&self) -> SessionId {
        self.revision.session
    }
}

/// A commit once the ordering service placed it in the trunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedCommit {
    pub revision: RevisionTag,
    pub change: Changeset,
    pub sequence_number: u64,
    pub reference_sequence_number: u64,
}

impl SequencedCommit {
    pub fn session(&self) -> SessionId {
        self.revision.session
    }
}

/// Commits of one peer that the peer had not seen sequenced when it
/// authored its latest commit, based on the trunk at `base`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct PeerBranch {
    pub base: u64,
    pub commits: Vec<Changeset>,
}
