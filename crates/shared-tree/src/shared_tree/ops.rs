use serde::{Deserialize, Serialize};

use crate::edit_manager::{RevisionTag, SessionId};

/// A commit submitted to the ordering service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundOp {
    pub session: SessionId,
    /// Position of the commit among this session's submissions.
    pub edit_number: u64,
    pub revision: RevisionTag,
    /// Last sequence number the session had processed when submitting.
    pub reference_sequence_number: u64,
    /// Wire encoding of the changeset.
    pub contents: String,
}

impl OutboundOp {
    /// The op as the ordering service broadcasts it.
    pub fn sequenced(self, sequence_number: u64, minimum_sequence_number: u64) -> SequencedOp {
        SequencedOp {
            sequence_number,
            reference_sequence_number: self.reference_sequence_number,
            minimum_sequence_number,
            session: self.session,
            edit_number: self.edit_number,
            revision: self.revision,
            contents: self.contents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOp {
    pub sequence_number: u64,
    pub reference_sequence_number: u64,
    /// No session will again submit an op referencing anything older.
    pub minimum_sequence_number: u64,
    pub session: SessionId,
    pub edit_number: u64,
    pub revision: RevisionTag,
    pub contents: String,
}
