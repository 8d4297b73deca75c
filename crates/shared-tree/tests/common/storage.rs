//! Summary storage that keeps uploads in memory and resolves handles.

use std::collections::BTreeMap;

use shared_tree_summarizer::{SnapshotTree, SummaryObject, SummaryProposal, SummaryStorage, SummaryTree};

#[derive(Default)]
pub struct MemoryStorage {
    snapshots: BTreeMap<String, SnapshotTree>,
    pub uploads: Vec<SummaryTree>,
    pub proposals: Vec<SummaryProposal>,
}

impl MemoryStorage {
    pub fn snapshot(&self, handle: &str) -> Option<&SnapshotTree> {
        self.snapshots.get(handle)
    }

    pub fn last_upload(&self) -> Option<&SummaryTree> {
        self.uploads.last()
    }
}

fn resolve(tree: &SummaryTree, parent: Option<&SnapshotTree>) -> Result<SnapshotTree, String> {
    let mut snapshot = SnapshotTree::default();
    for (key, object) in &tree.tree {
        match object {
            SummaryObject::Blob { content } => {
                snapshot.blobs.insert(key.clone(), content.clone());
            }
            SummaryObject::Tree(subtree) => {
                snapshot.trees.insert(key.clone(), resolve(subtree, parent)?);
            }
            SummaryObject::Handle { handle, .. } => {
                let parent = parent.ok_or_else(|| format!("handle {handle} without a parent summary"))?;
                let target = handle
                    .split('/')
                    .filter(|part| !part.is_empty())
                    .try_fold(parent, |tree, part| tree.trees.get(part))
                    .ok_or_else(|| format!("handle {handle} does not resolve"))?;
                snapshot.trees.insert(key.clone(), target.clone());
            }
        }
    }
    Ok(snapshot)
}

impl SummaryStorage for MemoryStorage {
    fn upload_summary(&mut self, summary: &SummaryTree, parent_handle: Option<&str>) -> Result<String, String> {
        let parent = parent_handle.and_then(|handle| self.snapshots.get(handle));
        let snapshot = resolve(summary, parent)?;
        let handle = format!("summary-{}", self.uploads.len() + 1);
        self.snapshots.insert(handle.clone(), snapshot);
        self.uploads.push(summary.clone());
        Ok(handle)
    }

    fn submit_proposal(&mut self, proposal: &SummaryProposal) -> Result<(), String> {
        self.proposals.push(proposal.clone());
        Ok(())
    }
}
