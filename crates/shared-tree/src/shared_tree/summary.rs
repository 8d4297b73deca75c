//! Summary layout of a shared tree.
//!
//! ```text
//! /
//! ├── editManager            blob: EditManagerSnapshot as JSON
//! └── .channels/
//!     ├── <root field>/
//!     │   └── content        blob: the field's nodes as JSON
//!     └── ...
//! ```
//!
//! Every root field has its own summarizer node, so a field no sequenced
//! commit touched since the last acknowledged summary is emitted as a handle.

use std::collections::BTreeMap;

use serde_json::Value;
use shared_tree_summarizer::{
    ChildSummarizers, GcData, SnapshotTree, Summarizable, SummarizeInternalResult, SummarizerError,
    SummaryStats, SummaryTree, CHANNELS_TREE_NAME,
};

use crate::edit_manager::{EditManager, EditManagerSnapshot};
use crate::error::EditManagerError;
use crate::tree::{FieldKey, FieldMap, Forest, TreeNode};

pub const EDIT_MANAGER_BLOB: &str = "editManager";
pub const CONTENT_BLOB: &str = "content";
/// Key of a value that references another object: `{"$handle": "<route>"}`.
pub const HANDLE_KEY: &str = "$handle";

/// Root node content: the edit manager state.
pub(crate) struct TreeSummarySource<'a> {
    pub edit_manager: &'a EditManager,
    pub forest: &'a Forest,
}

impl Summarizable for TreeSummarySource<'_> {
    fn summarize_internal(
        &mut self,
        full_tree: bool,
        track_state: bool,
        children: &mut ChildSummarizers<'_>,
    ) -> Result<SummarizeInternalResult, SummarizerError> {
        let mut summary = SummaryTree::new();
        let snapshot = self
            .edit_manager
            .snapshot()
            .to_json()
            .map_err(|err| SummarizerError::Serialize(err.to_string()))?;
        summary.add_blob(EDIT_MANAGER_BLOB, snapshot);

        let mut channels = SummaryTree::new();
        let ids: Vec<String> = children.ids().cloned().collect();
        for id in ids {
            let key = FieldKey::from(id.as_str());
            let mut field = FieldSource {
                id: &id,
                nodes: self.forest.root_field(&key),
            };
            let result = children.summarize(&id, full_tree, track_state, &mut field)?;
            channels.add_object(id.clone(), result.summary);
        }
        summary.add_tree(CHANNELS_TREE_NAME, channels);

        let stats = SummaryStats::of_tree(&summary);
        Ok(SummarizeInternalResult {
            id: String::new(),
            path_parts_for_children: Some(vec![CHANNELS_TREE_NAME.to_string()]),
            summary,
            stats,
        })
    }

    fn get_gc_data(
        &mut self,
        full_gc: bool,
        children: &mut ChildSummarizers<'_>,
    ) -> Result<GcData, SummarizerError> {
        let mut data = GcData::default();
        data.gc_nodes.insert("/".to_string(), Vec::new());
        let ids: Vec<String> = children.ids().cloned().collect();
        for id in ids {
            let key = FieldKey::from(id.as_str());
            let mut field = FieldSource {
                id: &id,
                nodes: self.forest.root_field(&key),
            };
            let child = children.get_gc_data(&id, full_gc, &mut field)?;
            data.add_child(&id, &child);
        }
        Ok(data)
    }
}

/// Content of one root field.
struct FieldSource<'a> {
    id: &'a str,
    nodes: &'a [TreeNode],
}

impl Summarizable for FieldSource<'_> {
    fn summarize_internal(
        &mut self,
        _full_tree: bool,
        _track_state: bool,
        _children: &mut ChildSummarizers<'_>,
    ) -> Result<SummarizeInternalResult, SummarizerError> {
        let content =
            serde_json::to_string(self.nodes).map_err(|err| SummarizerError::Serialize(err.to_string()))?;
        let mut summary = SummaryTree::new();
        summary.add_blob(CONTENT_BLOB, content);
        let stats = SummaryStats::of_tree(&summary);
        Ok(SummarizeInternalResult {
            id: self.id.to_string(),
            path_parts_for_children: None,
            summary,
            stats,
        })
    }

    fn get_gc_data(
        &mut self,
        _full_gc: bool,
        _children: &mut ChildSummarizers<'_>,
    ) -> Result<GcData, SummarizerError> {
        let mut routes = Vec::new();
        for node in self.nodes {
            collect_routes(node, &mut routes);
        }
        routes.sort();
        routes.dedup();
        let mut data = GcData::default();
        data.gc_nodes.insert("/".to_string(), routes);
        Ok(data)
    }
}

fn collect_routes(node: &TreeNode, routes: &mut Vec<String>) {
    if let Some(value) = &node.value {
        collect_value_routes(value, routes);
    }
    for child in node.fields.values().flatten() {
        collect_routes(child, routes);
    }
}

fn collect_value_routes(value: &Value, routes: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(route)) = map.get(HANDLE_KEY) {
                routes.push(route.clone());
            }
            for nested in map.values() {
                collect_value_routes(nested, routes);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_value_routes(item, routes)),
        _ => {}
    }
}

/// Reads the edit manager snapshot and the root fields back from a summary.
pub(crate) fn parse_snapshot(snapshot: &SnapshotTree) -> Result<(EditManagerSnapshot, FieldMap), EditManagerError> {
    let edit_manager = snapshot
        .blobs
        .get(EDIT_MANAGER_BLOB)
        .ok_or_else(|| EditManagerError::Snapshot(format!("missing {EDIT_MANAGER_BLOB} blob")))?;
    let edit_manager = EditManagerSnapshot::from_json(edit_manager)?;

    let mut fields = BTreeMap::new();
    if let Some(channels) = snapshot.trees.get(CHANNELS_TREE_NAME) {
        for (id, tree) in &channels.trees {
            let content = tree
                .blobs
                .get(CONTENT_BLOB)
                .ok_or_else(|| EditManagerError::Snapshot(format!("field {id} has no {CONTENT_BLOB} blob")))?;
            let nodes: Vec<TreeNode> =
                serde_json::from_str(content).map_err(|err| EditManagerError::Snapshot(err.to_string()))?;
            fields.insert(FieldKey::from(id.as_str()), nodes);
        }
    }
    Ok((edit_manager, fields))
}
