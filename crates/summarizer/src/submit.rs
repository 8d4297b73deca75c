//! Summary submission pipeline.
//!
//! [`submit_summary`] runs the stages of one summary attempt (base,
//! generate, upload, submit) and reports failures as a tagged
//! [`SubmitSummaryResult`] instead of an error. Cancellation is checked
//! between stages. The root node's work-in-progress state is cleared when the
//! attempt ends, whatever the outcome.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::node::{Summarizable, SummarizerNode};
use crate::summary::{SummaryStats, SummaryTree};

/// Shared flag checked between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitSummaryOptions {
    pub full_tree: bool,
    pub cancellation: CancellationToken,
}

/// The summary op sent to the ordering service once the tree is uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryProposal {
    pub handle: String,
    pub head: Option<String>,
    pub reference_sequence_number: u64,
}

/// Storage and ordering collaborators of the pipeline.
pub trait SummaryStorage {
    /// Uploads `summary`, resolving its handles against the summary
    /// `parent_handle`. Returns the handle of the uploaded summary.
    fn upload_summary(
        &mut self,
        summary: &SummaryTree,
        parent_handle: Option<&str>,
    ) -> Result<String, String>;

    fn submit_proposal(&mut self, proposal: &SummaryProposal) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStage {
    Base,
    Generate,
    Upload,
    Submit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitSummaryResult {
    Base {
        error: String,
    },
    Generate {
        reference_sequence_number: u64,
        error: String,
    },
    Upload {
        reference_sequence_number: u64,
        stats: SummaryStats,
        error: String,
    },
    /// The last stage; `error` is `None` when the proposal was submitted.
    Submit {
        reference_sequence_number: u64,
        stats: SummaryStats,
        handle: String,
        error: Option<String>,
    },
}

impl SubmitSummaryResult {
    pub fn stage(&self) -> SummaryStage {
        match self {
            SubmitSummaryResult::Base { .. } => SummaryStage::Base,
            SubmitSummaryResult::Generate { .. } => SummaryStage::Generate,
            SubmitSummaryResult::Upload { .. } => SummaryStage::Upload,
            SubmitSummaryResult::Submit { .. } => SummaryStage::Submit,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SubmitSummaryResult::Base { error }
            | SubmitSummaryResult::Generate { error, .. }
            | SubmitSummaryResult::Upload { error, .. } => Some(error),
            SubmitSummaryResult::Submit { error, .. } => error.as_deref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubmitSummaryResult::Submit { error: None, .. })
    }
}

/// Clears the node's work-in-progress summary when dropped.
struct ClearSummaryGuard<'a>(&'a mut SummarizerNode);

impl Deref for ClearSummaryGuard<'_> {
    type Target = SummarizerNode;

    fn deref(&self) -> &SummarizerNode {
        self.0
    }
}

impl DerefMut for ClearSummaryGuard<'_> {
    fn deref_mut(&mut self) -> &mut SummarizerNode {
        self.0
    }
}

impl Drop for ClearSummaryGuard<'_> {
    fn drop(&mut self) {
        self.0.clear_summary();
    }
}

const CANCELLED: &str = "summary attempt cancelled";

/// Runs one summary attempt at `reference_sequence_number` for the tree
/// rooted at `root`, whose content is `source`.
pub fn submit_summary(
    root: &mut SummarizerNode,
    source: &mut dyn Summarizable,
    storage: &mut dyn SummaryStorage,
    reference_sequence_number: u64,
    parent_handle: Option<&str>,
    options: &SubmitSummaryOptions,
) -> SubmitSummaryResult {
    let mut root = ClearSummaryGuard(root);

    // Base
    if options.cancellation.is_cancelled() {
        return SubmitSummaryResult::Base {
            error: CANCELLED.to_string(),
        };
    }
    if let Err(err) = root.start_summary(reference_sequence_number) {
        return SubmitSummaryResult::Base {
            error: err.to_string(),
        };
    }

    // Generate
    if options.cancellation.is_cancelled() {
        return SubmitSummaryResult::Generate {
            reference_sequence_number,
            error: CANCELLED.to_string(),
        };
    }
    // The root of an upload is always serialized, never a handle.
    let (summary, stats) = match root.summarize_tree(options.full_tree, source) {
        Ok(result) => result,
        Err(err) => {
            return SubmitSummaryResult::Generate {
                reference_sequence_number,
                error: err.to_string(),
            }
        }
    };

    // Upload
    if options.cancellation.is_cancelled() {
        return SubmitSummaryResult::Upload {
            reference_sequence_number,
            stats,
            error: CANCELLED.to_string(),
        };
    }
    let handle = match storage.upload_summary(&summary, parent_handle) {
        Ok(handle) => handle,
        Err(error) => {
            warn!(reference_sequence_number, %error, "summary upload failed");
            return SubmitSummaryResult::Upload {
                reference_sequence_number,
                stats,
                error,
            };
        }
    };

    // Submit
    let submit_error = |error: String| SubmitSummaryResult::Submit {
        reference_sequence_number,
        stats,
        handle: handle.clone(),
        error: Some(error),
    };
    if options.cancellation.is_cancelled() {
        return submit_error(CANCELLED.to_string());
    }
    if let Err(err) = root.complete_summary(&handle) {
        return submit_error(err.to_string());
    }
    let proposal = SummaryProposal {
        handle: handle.clone(),
        head: parent_handle.map(str::to_string),
        reference_sequence_number,
    };
    if let Err(error) = storage.submit_proposal(&proposal) {
        return submit_error(error);
    }
    debug!(reference_sequence_number, %handle, "summary submitted");
    SubmitSummaryResult::Submit {
        reference_sequence_number,
        stats,
        handle,
        error: None,
    }
}
