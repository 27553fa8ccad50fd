//! API error types and HTTP status mapping.

use thiserror::Error;

use crate::auth::refresh::RefreshError;
use crate::endpoints::EndpointError;
use crate::models::ApiErrorBody;

/// Cap on how much of an error response body ends up in error messages
/// and logs; server stack traces can run to many kilobytes.
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Authentication failed and could not be recovered by a refresh.
    /// The caller should send the user back to login.
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited by server")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("Endpoint resolution failed: {0}")]
    Endpoint(#[from] EndpointError),
}

impl ApiError {
    /// Map a non-success HTTP status and its body to an error. 401 is
    /// not mapped here; the client handles it via the refresh path
    /// before giving up with [`ApiError::Unauthorized`].
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = error_detail(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(detail),
            404 => ApiError::NotFound(detail),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(detail),
            _ => ApiError::InvalidResponse(format!("HTTP {}: {}", status.as_u16(), detail)),
        }
    }
}

/// Extract a human-readable message from an error response body.
///
/// Prefers the structured `detail`/`message` fields the backend uses;
/// falls back to the (truncated) raw body for anything else.
pub(crate) fn error_detail(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(description) = parsed.description() {
            return description.to_string();
        }
    }
    truncate_body(body)
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY_LENGTH {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &trimmed[..end])
}
