//! Document content and the locators that point into it.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `node` | [`TreeNode`], [`FieldKey`], [`TreeValue`] |
//! | `path` | [`NodePath`], [`FieldPath`], [`UpPath`] |
//! | `forest` | [`Forest`], the root fields of a document |
//! | `anchor` | [`AnchorSet`], node references that survive edits |

mod anchor;
mod forest;
mod node;
mod path;

pub use anchor::{Anchor, AnchorSet};
pub use forest::Forest;
pub use node::{FieldKey, FieldMap, TreeNode, TreeValue};
pub(crate) use node::value_repr;
pub use path::{display_path, is_prefix, split_node_path, FieldPath, NodePath, PathStep, UpPath};

use crate::delta::{visit_delta, Root};

/// Everything a branch owns about its view of the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeState {
    pub forest: Forest,
    pub anchors: AnchorSet,
}

impl TreeState {
    pub fn new(forest: Forest) -> Self {
        Self {
            forest,
            anchors: AnchorSet::new(),
        }
    }

    /// Applies one delta to the forest and the anchors.
    pub(crate) fn apply_delta(&mut self, delta: &Root) -> Result<(), String> {
        let mut forest = self.forest.visitor();
        visit_delta(delta, &mut forest);
        forest.finish()?;
        let mut anchors = self.anchors.visitor();
        visit_delta(delta, &mut anchors);
        Ok(())
    }
}
