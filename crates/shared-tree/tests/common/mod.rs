#![allow(dead_code)]

pub mod provider;
pub mod storage;

use serde_json::json;
use shared_tree::{FieldPath, Forest, TreeNode};
use tracing_subscriber::EnvFilter;

/// Log output for a failing test; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn leaf(value: &str) -> TreeNode {
    TreeNode::leaf("Leaf", json!(value))
}

pub fn leaves(values: &str) -> Vec<TreeNode> {
    values.chars().map(|c| leaf(&c.to_string())).collect()
}

/// String values of a root field, concatenated.
pub fn text(forest: &Forest, field: &str) -> String {
    forest
        .root_field(&field.into())
        .iter()
        .filter_map(|node| node.value.as_ref().and_then(|value| value.as_str()))
        .collect()
}

pub fn field(key: &str) -> FieldPath {
    FieldPath::root(key)
}
