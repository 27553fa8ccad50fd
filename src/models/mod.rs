//! Data models for the platform API.
//!
//! This module contains the wire-level structures exchanged with the
//! backend server:
//!
//! - `User`: the authenticated account returned by `/users/me`
//! - `Team`: the active tenant/workspace scope for requests
//! - `TokenResponse`: login/refresh payload carrying bearer credentials
//! - `ApiErrorBody`: the error JSON shape the server emits on failure

use serde::{Deserialize, Serialize};

/// The tenant/workspace scope attached to authenticated requests.
///
/// At most one team is active per session. Equality is by value; callers
/// that care about team *switches* should compare `id` only, since a team
/// may be renamed without changing identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Team {
    pub id: String,
    pub name: String,
}

impl Team {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Authenticated account details from `GET /users/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

/// Token payload returned by `POST /auth/login` and `POST /auth/refresh`.
///
/// In the cookie-based auth variant the server carries credentials in the
/// cookie jar instead, so `access_token` may be absent entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Error JSON shape the server emits on non-2xx responses.
///
/// FastAPI-style backends use `detail`; some proxies use `message`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiErrorBody {
    pub detail: Option<String>,
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Best human-readable description from the body, if any.
    pub fn description(&self) -> Option<&str> {
        self.detail.as_deref().or(self.message.as_deref())
    }
}
