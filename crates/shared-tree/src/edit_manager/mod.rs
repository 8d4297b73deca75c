//! Edit manager: the sequenced trunk plus the in-flight commits of every
//! session.
//!
//! # Overview
//!
//! Every session submits commits authored against the trunk at some
//! reference sequence number plus its own not-yet-sequenced commits. When a
//! commit is sequenced, each session independently computes the same trunk
//! version of it:
//!
//! 1. The author's *peer branch* (its commits the author had not seen
//!    sequenced) is advanced to the commit's reference sequence number.
//! 2. The commit, on top of that branch, is rebased over every trunk commit
//!    sequenced after its reference sequence number.
//!
//! Local commits of this session are kept rebased over the trunk tip. When a
//! peer commit lands, the local commits are rebased over it (a diamond) and
//! the net change to apply to the local view is returned.
//!
//! Trunk commits at or below the minimum sequence number are discarded; the
//! trimmed prefix is summarized by [`EditManager::trunk_base`].

mod commit;

pub use commit::{Commit, RevisionTag, SequencedCommit, SessionId};
use commit::PeerBranch;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::change::{rebase_branch, Changeset};
use crate::error::{ChangeError, EditManagerError};

/// What a sequenced commit means for the local view.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencedOutcome {
    /// This session's own commit; the local view already contains it.
    Acknowledged { commit: SequencedCommit },
    /// A peer's commit. `net` is the trunk change rebased over the local
    /// commits, i.e. what to apply to the local view.
    Remote {
        trunk_change: Changeset,
        net: Changeset,
    },
}

#[derive(Debug, Clone)]
pub struct EditManager {
    session: SessionId,
    trunk: Vec<SequencedCommit>,
    trunk_base: u64,
    last_sequence_number: u64,
    local: Vec<Commit>,
    peers: BTreeMap<SessionId, PeerBranch>,
    /// Next expected edit number per session.
    edit_numbers: BTreeMap<SessionId, u64>,
    next_edit_number: u64,
}

/// Trunk commits after `base` up to and including `to`.
fn trunk_range(trunk: &[SequencedCommit], base: u64, to: u64) -> impl Iterator<Item = &SequencedCommit> {
    trunk
        .iter()
        .filter(move |commit| commit.sequence_number > base && commit.sequence_number <= to)
}

fn rejected(sequence_number: u64, err: ChangeError) -> EditManagerError {
    error!(sequence_number, %err, "sequenced commit does not apply to the trunk");
    EditManagerError::InvalidSequencedChange {
        sequence_number,
        error: err,
    }
}

/// Moves a peer branch's base up to `to`, dropping the peer's commits that
/// got sequenced and rebasing the rest over everyone else's.
fn advance_peer(trunk: &[SequencedCommit], peer: SessionId, branch: &mut PeerBranch, to: u64) {
    if to <= branch.base {
        return;
    }
    for commit in trunk_range(trunk, branch.base, to) {
        if branch.commits.is_empty() {
            break;
        }
        if commit.session() == peer {
            branch.commits.remove(0);
        } else {
            branch.commits = rebase_branch(&branch.commits, &commit.change).0;
        }
    }
    branch.base = to;
}

impl EditManager {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            trunk: Vec::new(),
            trunk_base: 0,
            last_sequence_number: 0,
            local: Vec::new(),
            peers: BTreeMap::new(),
            edit_numbers: BTreeMap::new(),
            next_edit_number: 0,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn trunk(&self) -> &[SequencedCommit] {
        &self.trunk
    }

    /// Sequence number below which the trunk was trimmed.
    pub fn trunk_base(&self) -> u64 {
        self.trunk_base
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }

    pub fn local_changes(&self) -> &[Commit] {
        &self.local
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Records a commit submitted by this session; returns its edit number.
    pub fn add_local_change(&mut self, commit: Commit) -> u64 {
        let edit_number = self.next_edit_number;
        self.next_edit_number += 1;
        self.local.push(commit);
        edit_number
    }

    /// Processes the next commit of the sequenced stream. `change` is the
    /// commit as its author submitted it.
    pub fn add_sequenced_change(
        &mut self,
        revision: RevisionTag,
        edit_number: u64,
        change: Changeset,
        sequence_number: u64,
        reference_sequence_number: u64,
    ) -> Result<SequencedOutcome, EditManagerError> {
        self.add_sequenced_change_checked(
            revision,
            edit_number,
            change,
            sequence_number,
            reference_sequence_number,
            |_| Ok(()),
        )
    }

    /// Like [`EditManager::add_sequenced_change`], but hands the trunk
    /// version of the commit to `apply_to_trunk` before anything is recorded.
    /// When that fails the commit is rejected and the manager is left as it
    /// was.
    pub fn add_sequenced_change_checked<F>(
        &mut self,
        revision: RevisionTag,
        edit_number: u64,
        change: Changeset,
        sequence_number: u64,
        reference_sequence_number: u64,
        apply_to_trunk: F,
    ) -> Result<SequencedOutcome, EditManagerError>
    where
        F: FnOnce(&Changeset) -> Result<(), ChangeError>,
    {
        let session = revision.session;
        if sequence_number <= self.last_sequence_number {
            error!(sequence_number, last = self.last_sequence_number, "sequenced commit out of order");
            return Err(EditManagerError::OutOfOrderSequence {
                last: self.last_sequence_number,
                found: sequence_number,
            });
        }
        if reference_sequence_number < self.trunk_base {
            error!(reference_sequence_number, trunk_base = self.trunk_base, "commit based on trimmed trunk");
            return Err(EditManagerError::StaleReference {
                reference_sequence_number,
                trunk_base: self.trunk_base,
            });
        }
        let expected = self.edit_numbers.get(&session).copied().unwrap_or(0);
        if edit_number != expected {
            error!(%session, expected, found = edit_number, "edit numbers are not contiguous");
            return Err(EditManagerError::OutOfOrderEdit {
                session,
                expected,
                found: edit_number,
            });
        }

        if session == self.session {
            let head = match self.local.first() {
                Some(head) if head.revision == revision => head,
                head => {
                    error!(%revision, "acknowledged commit is not the oldest local commit");
                    return Err(EditManagerError::AckMismatch {
                        expected: head.map(|commit| commit.revision),
                        found: revision,
                    });
                }
            };
            apply_to_trunk(&head.change).map_err(|err| rejected(sequence_number, err))?;

            self.edit_numbers.insert(session, expected + 1);
            self.last_sequence_number = sequence_number;
            let local = self.local.remove(0);
            let commit = SequencedCommit {
                revision,
                change: local.change,
                sequence_number,
                reference_sequence_number,
            };
            self.trunk.push(commit.clone());
            debug!(%revision, sequence_number, "local commit acknowledged");
            return Ok(SequencedOutcome::Acknowledged { commit });
        }

        let mut branch = self.peers.get(&session).cloned().unwrap_or(PeerBranch {
            base: reference_sequence_number,
            commits: Vec::new(),
        });
        advance_peer(&self.trunk, session, &mut branch, reference_sequence_number);

        let mut pending = branch.commits.clone();
        pending.push(change.clone());
        for commit in self
            .trunk
            .iter()
            .filter(|commit| commit.sequence_number > reference_sequence_number)
        {
            if commit.session() == session {
                pending.remove(0);
            } else {
                pending = rebase_branch(&pending, &commit.change).0;
            }
            if pending.is_empty() {
                break;
            }
        }
        let trunk_change = pending.pop().unwrap_or_default();
        apply_to_trunk(&trunk_change).map_err(|err| rejected(sequence_number, err))?;

        self.edit_numbers.insert(session, expected + 1);
        self.last_sequence_number = sequence_number;
        branch.commits.push(change);
        self.peers.insert(session, branch);
        self.trunk.push(SequencedCommit {
            revision,
            change: trunk_change.clone(),
            sequence_number,
            reference_sequence_number,
        });

        let locals: Vec<Changeset> = self.local.iter().map(|commit| commit.change.clone()).collect();
        let (rebased, net) = rebase_branch(&locals, &trunk_change);
        for (commit, change) in self.local.iter_mut().zip(rebased) {
            commit.change = change;
        }
        debug!(
            %revision,
            sequence_number,
            local = self.local.len(),
            dropped = trunk_change.is_dropped(),
            "peer commit sequenced"
        );
        Ok(SequencedOutcome::Remote { trunk_change, net })
    }

    /// Forgets trunk history every session has seen.
    pub fn advance_minimum_sequence_number(&mut self, minimum_sequence_number: u64) {
        let msn = minimum_sequence_number.min(self.last_sequence_number);
        if msn <= self.trunk_base {
            return;
        }
        for (session, branch) in self.peers.iter_mut() {
            advance_peer(&self.trunk, *session, branch, msn);
        }
        self.peers.retain(|_, branch| !branch.commits.is_empty());
        let before = self.trunk.len();
        self.trunk.retain(|commit| commit.sequence_number > msn);
        self.trunk_base = msn;
        debug!(
            msn,
            trimmed = before - self.trunk.len(),
            remaining = self.trunk.len(),
            peers = self.peers.len(),
            "trunk trimmed"
        );
    }

    // ──────────────────────────────────────── Snapshots

    pub fn snapshot(&self) -> EditManagerSnapshot {
        EditManagerSnapshot {
            trunk_base: self.trunk_base,
            last_sequence_number: self.last_sequence_number,
            trunk: self.trunk.clone(),
            peers: self
                .peers
                .iter()
                .map(|(session, branch)| PeerSnapshot {
                    session: *session,
                    base: branch.base,
                    commits: branch.commits.clone(),
                })
                .collect(),
            edit_numbers: self
                .edit_numbers
                .iter()
                .map(|(session, next)| (*session, *next))
                .collect(),
        }
    }

    /// Edit manager of a session joining from a summary.
    pub fn from_snapshot(session: SessionId, snapshot: EditManagerSnapshot) -> Self {
        let mut manager = EditManager::new(session);
        manager.trunk_base = snapshot.trunk_base;
        manager.last_sequence_number = snapshot.last_sequence_number;
        manager.trunk = snapshot.trunk;
        manager.peers = snapshot
            .peers
            .into_iter()
            .map(|peer| {
                (
                    peer.session,
                    PeerBranch {
                        base: peer.base,
                        commits: peer.commits,
                    },
                )
            })
            .collect();
        manager.edit_numbers = snapshot.edit_numbers.into_iter().collect();
        manager
    }
}

/// Serialized edit manager state: enough for a joining session to sequence
/// later commits exactly as everyone else does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditManagerSnapshot {
    pub trunk_base: u64,
    pub last_sequence_number: u64,
    pub trunk: Vec<SequencedCommit>,
    pub peers: Vec<PeerSnapshot>,
    pub edit_numbers: Vec<(SessionId, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub session: SessionId,
    pub base: u64,
    pub commits: Vec<Changeset>,
}

impl EditManagerSnapshot {
    pub fn to_json(&self) -> Result<String, EditManagerError> {
        serde_json::to_string(self).map_err(|err| EditManagerError::Snapshot(err.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, EditManagerError> {
        serde_json::from_str(json).map_err(|err| EditManagerError::Snapshot(err.to_string()))
    }
}
