use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::registry::ValueKind;

pub type Result<T, E = AflowError> = std::result::Result<T, E>;

/// Errors surfaced by query construction, compilation and execution.
///
/// Construction and compile errors are returned by the call that caused
/// them. Execution errors are yielded in place of the record the failing
/// page would have produced.
#[derive(Debug, Error)]
pub enum AflowError {
    #[error("unknown property `{0}`")]
    UnknownProperty(String),

    #[error("type mismatch on `{property}`: expected {expected}, got {found}")]
    TypeMismatch {
        property: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    #[error("page size must be greater than 0")]
    InvalidPageSize,

    #[error("cursor belongs to a different query")]
    CursorMismatch,

    #[error("page fetch failed after {attempts} attempt(s): {source}")]
    TransientFetchFailure {
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("query rejected{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    QueryRejected {
        status: Option<u16>,
        message: String,
    },

    #[error("pagination inconsistency: {0}")]
    PaginationInconsistency(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("record has no `aurl`; select it to use entry operations")]
    MissingEntryUrl,
}

/// Failure reported by a transport for a single request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("could not connect: {0}")]
    Connect(String),

    /// The connection dropped while the response body was being read.
    #[error("response interrupted: {0}")]
    Interrupted(String),

    /// The request could not be built or followed (bad URL, redirect loop).
    #[error("invalid request: {0}")]
    Request(String),

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::Interrupted(_)
            | TransportError::RateLimited { .. } => true,
            TransportError::Status { code, .. } => retriable_status(*code),
            TransportError::Decode(_) | TransportError::Request(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<TransportError> for AflowError {
    /// Permanent transport failures. Transient ones are wrapped by the
    /// executor once its retry budget is spent.
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Decode(msg) => AflowError::MalformedResponse(msg),
            TransportError::Status { code, message } => AflowError::QueryRejected {
                status: Some(code),
                message,
            },
            other => AflowError::QueryRejected {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500..=599 | 429 | 408)
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct AfluxErrorResponse {
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
}

/// Renders a non-success AFLUX reply into a message worth showing a user.
pub(crate) fn describe_rejection(status: StatusCode, url: &str, body: &str) -> String {
    let parsed = serde_json::from_str::<AfluxErrorResponse>(body).ok();
    let title = parsed
        .as_ref()
        .and_then(|e| e.error.as_deref().or(e.message.as_deref()))
        .unwrap_or("");
    let detail = parsed
        .as_ref()
        .and_then(|e| e.detail.as_deref())
        .unwrap_or("");

    if status == StatusCode::NOT_FOUND {
        return format!(
            "AFLUX endpoint not found.\n- The configured base URL may be wrong\n- Recommended url: https://aflow.org/API/aflux/?\n\nrequest: {}",
            url
        );
    }

    if status == StatusCode::BAD_REQUEST && title.is_empty() {
        return format!(
            "AFLUX could not parse the matchbook.\n- Check keyword names with `help`\n\nrequest: {}\n{}",
            url,
            body.trim()
        );
    }

    if title.is_empty() && detail.is_empty() {
        return format!("request: {}\n{}", url, body.trim());
    }

    format!("{}\n{}\nrequest: {}", title, detail, url)
        .trim()
        .to_string()
}
