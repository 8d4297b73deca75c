use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizerError {
    #[error("already tracking a summary")]
    AlreadyTracking,
    #[error("summarize should not be called when not tracking the summary")]
    NotTracking,
    #[error("summarize did not run for node")]
    NodeNotSummarized,
    #[error("refreshing the latest summary while a summary is in progress")]
    RefreshWhileSummaryInProgress,
    #[error("summarizer node child already exists: {0}")]
    ChildAlreadyExists(String),
    #[error("no summarizer node child with id {0}")]
    MissingChild(String),
    #[error("cannot create child from summary if parent does not have latest summary")]
    ParentHasNoSummary,
    #[error("pending summary reference sequence number mismatch: expected {expected}, found {found}")]
    PendingSummaryMismatch { expected: u64, found: u64 },
    #[error("failed to serialize summary content: {0}")]
    Serialize(String),
    #[error("failed to fetch snapshot: {0}")]
    FetchSnapshot(String),
}
