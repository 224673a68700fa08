//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};

/// Errors surfaced by the sync core.
///
/// Transport-level failures never escape into widget code as panics; every
/// operation that can fail resolves to one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Send attempted on a channel that is not `Connected`. Recoverable once the
    /// channel reconnects.
    #[error("channel {0} is not connected")]
    NotConnected(String),
    /// Inbound payload failed structural validation. Dropped and counted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// The server explicitly declined a mutation.
    #[error("mutation rejected: {0}")]
    MutationRejected(String),
    /// The server requires (re-)authentication before accepting the mutation.
    #[error("authentication required")]
    Unverified,
    /// Network error or timeout.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// Reconnection gave up after the configured number of attempts.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("no endpoint configured, open the firehose first")]
    NoEndpoint,
    #[error("invalid conversation id: {0:?}")]
    InvalidConversation(String),
    #[error("connection manager has been shut down")]
    ShutDown,
    /// Another mutation for the same entity and actor has not resolved yet.
    #[error("a mutation for this entity is already in flight")]
    MutationInFlight,
}

/// RFC7807 Problem Details (application/problem+json)
///
/// Mutation endpoints may answer failures with this envelope instead of the
/// `{ success, message }` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_url: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// Error type for the HTTP mutation transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Network(String),
    Http { status: u16, body: String },
    Deserialize(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Network(msg) => write!(f, "Network error: {}", msg),
            ApiError::Http { status, body } => write!(f, "HTTP {}: {}", status, body),
            ApiError::Deserialize(msg) => write!(f, "Deserialization error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http { status: 401 | 403, .. } => SyncError::Unverified,
            other => SyncError::TransportFailure(other.to_string()),
        }
    }
}
