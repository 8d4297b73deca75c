//! Incremental summarization for collaborative documents.
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`summary`] | Summary trees, snapshot trees, escaped paths, GC data |
//! | [`node`] | [`SummarizerNode`] tree with handle reuse and pending summaries |
//! | [`submit`] | Staged, cancellable summary submission |

pub mod error;
pub mod node;
pub mod submit;
pub mod summary;

pub use error::SummarizerError;
pub use node::{
    ChildSummarizers, CreateChildSource, RefreshSummaryResult, Summarizable,
    SummarizeInternalResult, SummarizeResult, SummarizerNode, SummarizerNodeConfig,
};
pub use submit::{
    submit_summary, CancellationToken, SubmitSummaryOptions, SubmitSummaryResult, SummaryProposal,
    SummaryStage, SummaryStorage,
};
pub use summary::{
    EscapedPath, GcData, SnapshotTree, SummaryNode, SummaryObject, SummaryStats, SummaryTree,
    SummaryType, CHANNELS_TREE_NAME,
};
