//! Error types and failure classification for Graph traffic.
//!
//! Remote failures are classified once, at the network boundary, into an
//! [`ErrorKind`]. Retry and batch logic branch on that tag only.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using `GraphSyncError`.
pub type GraphResult<T> = Result<T, GraphSyncError>;

/// Substring Graph uses when an added reference is already present.
const ALREADY_EXISTS_MARKER: &str = "object references already exist";

/// Errors that can occur while moving traffic to and from Microsoft Graph.
#[derive(Debug, Error)]
pub enum GraphSyncError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller passed an argument the component can never satisfy.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Microsoft Graph answered with a non-success status.
    #[error("Graph API error ({status}): {code} - {message}")]
    GraphApi {
        status: u16,
        code: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// A single batch item failed.
    #[error("Batch operation failed: {0}")]
    BatchItem(BatchItemError),

    /// Several batch items failed in the same submission pass.
    #[error("{} batch operations failed: {}", .failures.len(), summarize(.failures))]
    Aggregate { failures: Vec<BatchItemError> },

    /// Delta watermark expired or invalid.
    #[error("Delta token expired, full sync required")]
    DeltaTokenExpired,

    /// The requested membership change is contradictory.
    #[error("Invalid membership delta: {0}")]
    InvalidDelta(String),

    /// Executing the change would break an owner-count invariant.
    #[error("Owner invariant violation: {0}")]
    InvariantViolation(String),

    /// A pooled reconciliation task panicked or was aborted.
    #[error("Reconciliation task failed: {0}")]
    TaskFailed(String),
}

/// Closed set of failure classes that retry and batch logic branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, bad gateways and connection failures.
    TransientNetwork,
    /// HTTP 429, with the server's `Retry-After` hint when present.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 404, often read-after-write replication lag.
    NotFound,
    /// HTTP 400 reporting that the reference to add already exists.
    AlreadyExists,
    /// Cancellation; never retried.
    Cancelled,
    /// Everything else.
    Terminal,
}

impl ErrorKind {
    /// Classifies an HTTP status plus optional Graph error code/message.
    #[must_use]
    pub fn from_status(
        status: u16,
        code: &str,
        message: &str,
        retry_after_secs: Option<u64>,
    ) -> Self {
        match status {
            429 => Self::RateLimited {
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            404 => Self::NotFound,
            408 | 502 | 503 | 504 => Self::TransientNetwork,
            400 if is_already_exists(code, message) => Self::AlreadyExists,
            _ => Self::Terminal,
        }
    }
}

impl GraphSyncError {
    /// Returns the failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::GraphApi {
                status,
                code,
                message,
                retry_after_secs,
            } => ErrorKind::from_status(*status, code, message, *retry_after_secs),
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::TransientNetwork,
            Self::Http(e) => match e.status() {
                Some(status) => ErrorKind::from_status(status.as_u16(), "", "", None),
                None => ErrorKind::Terminal,
            },
            Self::BatchItem(item) => item.kind(),
            _ => ErrorKind::Terminal,
        }
    }

    /// Whether the default retry policy would retry this error.
    ///
    /// Timeouts, bad gateways, throttling and 404-on-lookup are retryable;
    /// cancellation never is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::RateLimited { .. } | ErrorKind::NotFound
        )
    }

    /// Whether this error is the cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Server-provided delay hint, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self.kind() {
            ErrorKind::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }

    /// HTTP status associated with the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::GraphApi { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::BatchItem(item) => Some(item.status),
            _ => None,
        }
    }

    /// Builds a single or aggregate error from the failures of one pass.
    ///
    /// Returns `None` when there is nothing to report.
    #[must_use]
    pub fn from_failures(mut failures: Vec<BatchItemError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(Self::BatchItem),
            _ => Some(Self::Aggregate { failures }),
        }
    }

    /// The per-item failures carried by a batch error.
    #[must_use]
    pub fn batch_failures(&self) -> &[BatchItemError] {
        match self {
            Self::BatchItem(item) => std::slice::from_ref(item),
            Self::Aggregate { failures } => failures,
            _ => &[],
        }
    }
}

/// Cause attached to a batch item classified as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemError {
    /// Correlation id of the failed operation.
    pub id: String,
    /// HTTP status of the item (0 when no per-item response was received).
    pub status: u16,
    /// Graph error code, when the body carried one.
    pub code: Option<String>,
    /// Graph error message or a locally constructed description.
    pub message: String,
}

impl BatchItemError {
    /// Creates an item error for `id`.
    pub fn new(
        id: impl Into<String>,
        status: u16,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            code,
            message: message.into(),
        }
    }

    /// Failure class of this item.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_status(
            self.status,
            self.code.as_deref().unwrap_or_default(),
            &self.message,
            None,
        )
    }
}

impl fmt::Display for BatchItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(
                f,
                "[{}] {} {}: {}",
                self.id, self.status, code, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.id, self.status, self.message),
        }
    }
}

fn summarize(failures: &[BatchItemError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Whether a 400 body reports that the added reference already exists.
#[must_use]
pub fn is_already_exists(code: &str, message: &str) -> bool {
    code.to_ascii_lowercase().contains(ALREADY_EXISTS_MARKER)
        || message.to_ascii_lowercase().contains(ALREADY_EXISTS_MARKER)
}
