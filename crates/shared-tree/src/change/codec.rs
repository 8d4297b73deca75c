use serde::{Deserialize, Serialize};

use super::{Changeset, Op};
use crate::error::ChangeError;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EncodedRef<'a> {
    version: u32,
    ops: &'a [Op],
}

#[derive(Deserialize)]
struct Encoded {
    version: u32,
    ops: Vec<Op>,
}

/// JSON wire form of a [`Changeset`].
pub struct ChangeCodec;

impl ChangeCodec {
    pub fn encode(change: &Changeset) -> Result<String, ChangeError> {
        serde_json::to_string(&EncodedRef {
            version: FORMAT_VERSION,
            ops: &change.ops,
        })
        .map_err(|err| ChangeError::Decode(err.to_string()))
    }

    pub fn decode(contents: &str) -> Result<Changeset, ChangeError> {
        let encoded: Encoded =
            serde_json::from_str(contents).map_err(|err| ChangeError::Decode(err.to_string()))?;
        if encoded.version != FORMAT_VERSION {
            return Err(ChangeError::Decode(format!(
                "unsupported format version {}",
                encoded.version
            )));
        }
        if let Some(op) = encoded.ops.iter().find(|op| !ranges_fit(op)) {
            return Err(ChangeError::Decode(format!("op range overflows: {op:?}")));
        }
        Ok(Changeset::new(encoded.ops))
    }
}

/// Ranges a decoded op spans must be addressable.
fn ranges_fit(op: &Op) -> bool {
    match op {
        Op::Delete { index, count, .. } => index.checked_add(*count).is_some(),
        Op::Move {
            src_index,
            count,
            dst_index,
            ..
        } => src_index.checked_add(*count).is_some() && dst_index.checked_add(*count).is_some(),
        Op::SetValue { .. } | Op::Insert { .. } | Op::Constraint { .. } => true,
    }
}
