//! Summary data model: the tree of blobs, subtrees and handles produced by a
//! summarize pass, the snapshot trees read back from storage, and the paths
//! used to address previously uploaded subtrees.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Name of the subtree that holds a node's children in a summary.
pub const CHANNELS_TREE_NAME: &str = ".channels";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SummaryType {
    Tree,
    Blob,
    Handle,
}

/// One entry of a summary tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SummaryObject {
    Tree(SummaryTree),
    Blob {
        content: String,
    },
    /// Reference to a subtree of the last acknowledged summary.
    Handle {
        handle_type: SummaryType,
        handle: String,
    },
}

impl SummaryObject {
    pub fn summary_type(&self) -> SummaryType {
        match self {
            SummaryObject::Tree(_) => SummaryType::Tree,
            SummaryObject::Blob { .. } => SummaryType::Blob,
            SummaryObject::Handle { .. } => SummaryType::Handle,
        }
    }

    pub fn as_tree(&self) -> Option<&SummaryTree> {
        match self {
            SummaryObject::Tree(tree) => Some(tree),
            SummaryObject::Blob { .. } | SummaryObject::Handle { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub tree: IndexMap<String, SummaryObject>,
}

impl SummaryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&mut self, key: impl Into<String>, content: impl Into<String>) {
        self.tree.insert(
            key.into(),
            SummaryObject::Blob {
                content: content.into(),
            },
        );
    }

    pub fn add_tree(&mut self, key: impl Into<String>, tree: SummaryTree) {
        self.tree.insert(key.into(), SummaryObject::Tree(tree));
    }

    pub fn add_object(&mut self, key: impl Into<String>, object: SummaryObject) {
        self.tree.insert(key.into(), object);
    }

    pub fn get(&self, key: &str) -> Option<&SummaryObject> {
        self.tree.get(key)
    }
}

/// Counters accumulated while summarizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub tree_node_count: usize,
    pub blob_node_count: usize,
    pub handle_node_count: usize,
    pub total_blob_size: usize,
    pub unreferenced_blob_size: usize,
}

impl SummaryStats {
    pub fn merge(&mut self, other: &SummaryStats) {
        self.tree_node_count += other.tree_node_count;
        self.blob_node_count += other.blob_node_count;
        self.handle_node_count += other.handle_node_count;
        self.total_blob_size += other.total_blob_size;
        self.unreferenced_blob_size += other.unreferenced_blob_size;
    }

    /// Counts the nodes of `tree`, not descending into handles.
    pub fn of_tree(tree: &SummaryTree) -> Self {
        let mut stats = SummaryStats {
            tree_node_count: 1,
            ..SummaryStats::default()
        };
        for object in tree.tree.values() {
            match object {
                SummaryObject::Tree(sub) => stats.merge(&SummaryStats::of_tree(sub)),
                SummaryObject::Blob { content } => {
                    stats.blob_node_count += 1;
                    stats.total_blob_size += content.len();
                }
                SummaryObject::Handle { .. } => stats.handle_node_count += 1,
            }
        }
        stats
    }
}

/// Tree read back from storage. Handles never appear here: storage resolves
/// them against the summary they point into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub blobs: BTreeMap<String, String>,
    pub trees: BTreeMap<String, SnapshotTree>,
}

impl SnapshotTree {
    /// Looks up a subtree by an escaped `/`-separated path.
    pub fn subtree(&self, path: &EscapedPath) -> Option<&SnapshotTree> {
        path.parts()
            .try_fold(self, |tree, part| tree.trees.get(part.as_str()))
    }
}

/// Splits a snapshot into the tree holding its children and the path part
/// that leads there.
pub fn parse_summary_for_subtrees(tree: &SnapshotTree) -> (&SnapshotTree, Option<&'static str>) {
    match tree.trees.get(CHANNELS_TREE_NAME) {
        Some(channels) => (channels, Some(CHANNELS_TREE_NAME)),
        None => (tree, None),
    }
}

/// A `/`-joined path whose parts are escaped so they may contain `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscapedPath(String);

impl EscapedPath {
    pub fn create(part: &str) -> Self {
        EscapedPath(escape(part))
    }

    pub fn create_and_concat(parts: &[String]) -> Self {
        let mut parts = parts.iter();
        let Some(first) = parts.next() else {
            return EscapedPath::default();
        };
        parts.fold(EscapedPath::create(first), |path, part| {
            path.concat(&EscapedPath::create(part))
        })
    }

    pub fn concat(&self, other: &EscapedPath) -> Self {
        EscapedPath(format!("{}/{}", self.0, other.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unescaped parts, skipping empty ones.
    pub fn parts(&self) -> impl Iterator<Item = String> + '_ {
        self.0.split('/').filter(|p| !p.is_empty()).map(unescape)
    }
}

impl std::fmt::Display for EscapedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(part: &str) -> String {
    part.replace("%2F", "/").replace("%25", "%")
}

/// Location and reference sequence number of a summary of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryNode {
    pub reference_sequence_number: u64,
    pub base_path: Option<EscapedPath>,
    pub local_path: EscapedPath,
    pub additional_path: Option<EscapedPath>,
}

impl SummaryNode {
    pub fn new(
        reference_sequence_number: u64,
        base_path: Option<EscapedPath>,
        local_path: EscapedPath,
    ) -> Self {
        Self {
            reference_sequence_number,
            base_path,
            local_path,
            additional_path: None,
        }
    }

    pub fn full_path(&self) -> EscapedPath {
        match &self.base_path {
            Some(base) => base.concat(&self.local_path),
            None => self.local_path.clone(),
        }
    }

    pub fn full_path_for_children(&self) -> EscapedPath {
        match &self.additional_path {
            Some(additional) => self.full_path().concat(additional),
            None => self.full_path(),
        }
    }

    pub fn create_for_child(&self, id: &str) -> SummaryNode {
        SummaryNode::new(
            self.reference_sequence_number,
            Some(self.full_path_for_children()),
            EscapedPath::create(id),
        )
    }
}

/// Outbound references of each node, keyed by node path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcData {
    pub gc_nodes: BTreeMap<String, Vec<String>>,
}

impl GcData {
    /// Merges a child's data, prefixing every node path with `/<id>`.
    pub fn add_child(&mut self, id: &str, child: &GcData) {
        for (path, routes) in &child.gc_nodes {
            let prefixed = if path == "/" {
                format!("/{}", escape(id))
            } else {
                format!("/{}{}", escape(id), path)
            };
            self.gc_nodes.insert(prefixed, routes.clone());
        }
    }
}
