use serde::Deserialize;
use shared_tree_summarizer::SummarizerNodeConfig;

/// Options of a [`crate::SharedTree`].
///
/// ```
/// use shared_tree::SharedTreeOptions;
///
/// let options = SharedTreeOptions::from_json(r#"{"maxRevertibles": 4}"#).unwrap();
/// assert_eq!(options.max_revertibles, 4);
/// assert!(options.summarizer.can_reuse_handle);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharedTreeOptions {
    pub summarizer: SummarizerNodeConfig,
    /// How many sequenced commits of this session stay revertible.
    pub max_revertibles: usize,
}

impl Default for SharedTreeOptions {
    fn default() -> Self {
        Self {
            summarizer: SummarizerNodeConfig::default(),
            max_revertibles: 64,
        }
    }
}

impl SharedTreeOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
