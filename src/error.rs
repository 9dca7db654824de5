use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the validator refused a URL. Serialized as the snake_case names used in
/// logs and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("malformed")]
    Malformed,
    #[error("private_network")]
    PrivateNetwork,
    #[error("blocklisted")]
    Blocklisted,
    #[error("traversal")]
    Traversal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("content too large (limit {limit} bytes)")]
    ContentTooLarge { limit: u64 },
    #[error("http status {status}")]
    Status { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("redirect rejected: {0}")]
    Redirect(String),
    #[error("connection refused: {0}")]
    Blocked(String),
}

impl FetchError {
    /// Transient failures are retried by the fetcher's retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status { status } => *status == 429 || (500..600).contains(status),
            FetchError::Timeout { .. }
            | FetchError::ContentTooLarge { .. }
            | FetchError::Redirect(_)
            | FetchError::Blocked(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider returned an empty completion")]
    EmptyCompletion,
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_)
                | LlmError::Unavailable(_)
                | LlmError::Timeout { .. }
                | LlmError::EmptyCompletion
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("no structured content found in model output")]
    NoStructuredContent,
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("model output is a non-answer")]
    NonAnswer,
    #[error("model output flagged as unsafe: {0}")]
    Unsafe(String),
}

/// Top-level failure of one analysis request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzeError {
    #[error("url rejected: {0}")]
    Rejected(RejectionReason),
    #[error("invalid request option: {0}")]
    InvalidOption(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("document has no analyzable text")]
    NoContent,
    #[error("all {chunks} chunk(s) failed analysis")]
    AllChunksFailed { chunks: usize },
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("request timed out after {secs}s")]
    TimedOut { secs: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RejectionReason> for AnalyzeError {
    fn from(reason: RejectionReason) -> Self {
        AnalyzeError::Rejected(reason)
    }
}

impl AnalyzeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalyzeError::Rejected(_) | AnalyzeError::Fetch(FetchError::Blocked(_)) => {
                ErrorKind::Rejected
            }
            AnalyzeError::InvalidOption(_) => ErrorKind::InvalidRequest,
            AnalyzeError::Fetch(FetchError::Status { status }) if (400..500).contains(status) => {
                ErrorKind::FetchFailed
            }
            AnalyzeError::Fetch(FetchError::ContentTooLarge { .. })
            | AnalyzeError::Fetch(FetchError::Redirect(_)) => ErrorKind::FetchFailed,
            AnalyzeError::Fetch(_) => ErrorKind::UpstreamUnavailable,
            AnalyzeError::NoContent => ErrorKind::NoContent,
            AnalyzeError::AllChunksFailed { .. } => ErrorKind::AllChunksFailed,
            AnalyzeError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            AnalyzeError::TimedOut { .. } => ErrorKind::TimedOut,
            AnalyzeError::Cancelled => ErrorKind::Cancelled,
            AnalyzeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when retrying the same input cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Rejected
                | ErrorKind::InvalidRequest
                | ErrorKind::FetchFailed
                | ErrorKind::NoContent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Rejected,
    InvalidRequest,
    FetchFailed,
    UpstreamUnavailable,
    NoContent,
    AllChunksFailed,
    BudgetExceeded,
    TimedOut,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Rejected => "rejected",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::NoContent => "no_content",
            ErrorKind::AllChunksFailed => "all_chunks_failed",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
