use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of a field under a node (or of a root field of a document).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldKey(String);

impl FieldKey {
    pub fn new(key: impl Into<String>) -> Self {
        FieldKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldKey {
    fn from(key: &str) -> Self {
        FieldKey(key.to_string())
    }
}

impl From<String> for FieldKey {
    fn from(key: String) -> Self {
        FieldKey(key)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value stored on a node. `None` is "undefined", which is distinct from a
/// JSON `null`.
pub type TreeValue = Option<Value>;

/// Ordered children of every field of a node.
pub type FieldMap = BTreeMap<FieldKey, Vec<TreeNode>>;

/// A node of document content; also the JSON-able form used on the wire and
/// in summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "value_repr")]
    pub value: TreeValue,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: FieldMap,
}

impl TreeNode {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            value: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn leaf(ty: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            ty: ty.into(),
            value: Some(value.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<FieldKey>, children: Vec<TreeNode>) -> Self {
        let key = key.into();
        if children.is_empty() {
            self.fields.remove(&key);
        } else {
            self.fields.insert(key, children);
        }
        self
    }

    pub fn field(&self, key: &FieldKey) -> &[TreeNode] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of nodes in this subtree, this node included.
    pub fn size(&self) -> usize {
        1 + self
            .fields
            .values()
            .flat_map(|children| children.iter())
            .map(TreeNode::size)
            .sum::<usize>()
    }
}

/// Serde representation of [`TreeValue`] that keeps "undefined" and `null`
/// apart: a defined value is wrapped in a one-element array.
pub(crate) mod value_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_ref().map(std::slice::from_ref).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
        let wrapped: Option<[Value; 1]> = Option::deserialize(deserializer)?;
        Ok(wrapped.map(|[value]| value))
    }
}
