//! Single-flight access-token refresh.
//!
//! Any number of requests can hit a 401 at the same moment; only one
//! refresh call may reach the server, and every waiter must see that
//! one call's outcome. The coordinator is a two-state machine:
//!
//! - **Idle**: the in-flight slot is `None`
//! - **Refreshing**: the slot holds a [`Shared`] future that every
//!   concurrent caller clones and awaits
//!
//! A failed refresh is fatal for the session: credentials are cleared
//! (logout) before the shared rejection is delivered.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::api::error::error_detail;
use crate::auth::session::SessionManager;
use crate::config::AuthMode;
use crate::models::TokenResponse;

/// Refresh failures are cloneable so one outcome can be handed to
/// every waiter on the shared future.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("refresh rejected with status {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("network error during refresh: {0}")]
    Network(String),

    #[error("malformed refresh response: {0}")]
    Malformed(String),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// Process-wide coordinator for token refresh. One instance lives
/// inside the API client; per-call instances would defeat the
/// single-flight guarantee.
pub struct RefreshCoordinator {
    session: Arc<SessionManager>,
    http: reqwest::Client,
    refresh_url: String,
    auth_mode: AuthMode,
    in_flight: Arc<Mutex<Option<SharedRefresh>>>,
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<SessionManager>,
        http: reqwest::Client,
        refresh_url: String,
        auth_mode: AuthMode,
    ) -> Self {
        Self {
            session,
            http,
            refresh_url,
            auth_mode,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Obtain a fresh access token, joining any refresh already in
    /// flight. In cookie mode the refreshed credential lands in the
    /// cookie jar and the returned string may be empty; callers should
    /// re-read headers from the session rather than use the return
    /// value directly.
    pub async fn ensure_fresh(&self) -> Result<String, RefreshError> {
        let fut = {
            let mut slot = self.in_flight.lock().expect("refresh slot lock poisoned");
            match slot.as_ref() {
                Some(fut) => {
                    debug!("Refresh already in flight, awaiting shared result");
                    fut.clone()
                }
                None => {
                    let fut = Self::run(
                        Arc::clone(&self.session),
                        self.http.clone(),
                        self.refresh_url.clone(),
                        self.auth_mode,
                        Arc::clone(&self.in_flight),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    /// Drive one refresh to completion, then return the coordinator to
    /// idle. Failure clears the whole session before waiters wake.
    async fn run(
        session: Arc<SessionManager>,
        http: reqwest::Client,
        url: String,
        auth_mode: AuthMode,
        slot: Arc<Mutex<Option<SharedRefresh>>>,
    ) -> Result<String, RefreshError> {
        let result = Self::mint_token(&session, &http, &url, auth_mode).await;
        if let Err(e) = &result {
            warn!(error = %e, "Token refresh failed, clearing session");
            session.clear();
        }
        // Back to idle.
        *slot.lock().expect("refresh slot lock poisoned") = None;
        result
    }

    async fn mint_token(
        session: &SessionManager,
        http: &reqwest::Client,
        url: &str,
        auth_mode: AuthMode,
    ) -> Result<String, RefreshError> {
        let mut request = http.post(url);
        match auth_mode {
            AuthMode::Bearer => {
                // Checked before any network traffic: without a refresh
                // token there is nothing to send.
                let refresh_token = session
                    .refresh_token()
                    .ok_or(RefreshError::NoRefreshToken)?;
                request = request.json(&serde_json::json!({ "refresh_token": refresh_token }));
            }
            AuthMode::Cookie => {
                // The cookie jar carries the refresh credential.
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Malformed(e.to_string()))?;

        match tokens.access_token {
            Some(access_token) => {
                session.set_tokens(&access_token, tokens.refresh_token.as_deref());
                debug!("Access token refreshed");
                Ok(access_token)
            }
            None if auth_mode == AuthMode::Cookie => Ok(String::new()),
            None => Err(RefreshError::Malformed(
                "response missing access_token".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;

    fn session_with_refresh_token(token: &str) -> Arc<SessionManager> {
        let session = SessionManager::new(Box::new(MemoryStorage::new()));
        session.set_refresh_token(Some(token));
        session
    }

    fn coordinator(session: Arc<SessionManager>, server: &mockito::ServerGuard) -> RefreshCoordinator {
        RefreshCoordinator::new(
            session,
            reqwest::Client::new(),
            format!("{}/auth/refresh", server.url()),
            AuthMode::Bearer,
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh-tok","refresh_token":"fresh-ref"}"#)
            .expect(1)
            .create_async()
            .await;

        let session = session_with_refresh_token("old-ref");
        let coordinator = coordinator(Arc::clone(&session), &server);

        let (a, b, c) = tokio::join!(
            coordinator.ensure_fresh(),
            coordinator.ensure_fresh(),
            coordinator.ensure_fresh(),
        );

        assert_eq!(a.as_deref(), Ok("fresh-tok"));
        assert_eq!(b.as_deref(), Ok("fresh-tok"));
        assert_eq!(c.as_deref(), Ok("fresh-tok"));
        mock.assert_async().await;

        // Rotated refresh token overwrote the old one.
        assert_eq!(session.refresh_token().as_deref(), Some("fresh-ref"));
        assert_eq!(session.access_token().as_deref(), Some("fresh-tok"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_session_for_all_waiters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"detail":"refresh token expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let session = session_with_refresh_token("stale-ref");
        session.set_access_token(Some("stale-tok"));
        let coordinator = coordinator(Arc::clone(&session), &server);

        let (a, b) = tokio::join!(coordinator.ensure_fresh(), coordinator.ensure_fresh());

        let expected = RefreshError::Rejected {
            status: 401,
            detail: "refresh token expired".to_string(),
        };
        assert_eq!(a, Err(expected.clone()));
        assert_eq!(b, Err(expected));
        mock.assert_async().await;

        // Refresh failure is a logout.
        assert!(session.access_token().is_none());
        assert!(session.refresh_token().is_none());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_network_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let session = SessionManager::new(Box::new(MemoryStorage::new()));
        let coordinator = coordinator(session, &server);

        let result = coordinator.ensure_fresh().await;
        assert_eq!(result, Err(RefreshError::NoRefreshToken));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_old_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh-tok"}"#)
            .create_async()
            .await;

        let session = session_with_refresh_token("keep-me");
        let coordinator = coordinator(Arc::clone(&session), &server);

        let token = coordinator.ensure_fresh().await.unwrap();
        assert_eq!(token, "fresh-tok");
        assert_eq!(session.refresh_token().as_deref(), Some("keep-me"));
    }

    #[tokio::test]
    async fn test_coordinator_returns_to_idle_after_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok"}"#)
            .expect(2)
            .create_async()
            .await;

        let session = session_with_refresh_token("ref");
        let coordinator = coordinator(session, &server);

        coordinator.ensure_fresh().await.unwrap();
        // A second, sequential call is a new flight.
        coordinator.ensure_fresh().await.unwrap();
        mock.assert_async().await;
    }
}
