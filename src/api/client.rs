//! Authenticated HTTP client for the backend API.
//!
//! [`ApiClient`] owns the HTTP connection pool, the base URL, and the
//! refresh coordinator. Every request goes through one path:
//!
//! 1. build auth headers from the current session (bearer token plus
//!    team scope headers),
//! 2. send,
//! 3. on a 401, run exactly one token refresh and retry exactly once,
//! 4. a second 401 surfaces as [`ApiError::Unauthorized`] and the
//!    caller sends the user back to login.
//!
//! Login itself never enters the refresh path; a 401 there means bad
//! credentials, not a stale token.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::error::{error_detail, ApiError};
use crate::auth::refresh::RefreshCoordinator;
use crate::auth::session::SessionManager;
use crate::config::{AuthMode, Config, DEFAULT_API_PORT};
use crate::endpoints::{self, Params};
use crate::models::{Team, TokenResponse, User};

/// Request timeout. Generous because some backend operations (model
/// listing on cold disks, job submission) are slow to first byte.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Team scope headers attached to every authenticated request
const TEAM_ID_HEADER: &str = "x-team-id";
const TEAM_NAME_HEADER: &str = "x-team-name";

/// Request body for [`ApiClient::execute`]. Cloneable so the 401 retry
/// can resend the same payload.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Client for the backend REST API.
///
/// Cheap to clone; clones share the connection pool, the session, and
/// the single-flight refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_mode: AuthMode,
    session: Arc<SessionManager>,
    refresh: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(config: &Config, session: Arc<SessionManager>) -> anyhow::Result<Self> {
        let base_url = config
            .api_base
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", DEFAULT_API_PORT));
        let base_url = base_url.trim_end_matches('/').to_string();

        // The cookie store is always on: in cookie auth mode it carries
        // the credentials, and in bearer mode it is harmless.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .cookie_store(true)
            .build()?;

        let refresh_path = endpoints::resolve("auth", &["refresh"], &Params::new())?.path;
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&session),
            http.clone(),
            format!("{}{}", base_url, refresh_path),
            config.auth_mode,
        ));

        debug!(base_url = %base_url, auth_mode = ?config.auth_mode, "API client created");
        Ok(Self {
            http,
            base_url,
            auth_mode: config.auth_mode,
            session,
            refresh,
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Absolute URL for a path. Paths that are already absolute pass
    /// through untouched so callers can follow server-provided links.
    pub fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    // ===== Request pipeline =====

    /// Headers derived from the current session: bearer credential (in
    /// bearer mode) and team scope.
    fn auth_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();

        if self.auth_mode == AuthMode::Bearer {
            if let Some(token) = self.session.access_token() {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".to_string()))?;
                headers.insert(AUTHORIZATION, value);
            }
        }

        if let Some(team) = self.session.team() {
            headers.insert(
                TEAM_ID_HEADER,
                HeaderValue::from_str(&team.id)
                    .map_err(|_| ApiError::InvalidRequest("team id is not a valid header value".to_string()))?,
            );
            headers.insert(
                TEAM_NAME_HEADER,
                HeaderValue::from_str(&team.name)
                    .map_err(|_| ApiError::InvalidRequest("team name is not a valid header value".to_string()))?,
            );
        }

        Ok(headers)
    }

    /// One send, no retry. Auth headers are read fresh from the session
    /// on every call, so a retry after refresh picks up the new token.
    /// Caller-supplied headers are applied last and win on collision.
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        payload: &Payload,
        extra_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ApiError> {
        let mut headers = self.auth_headers()?;
        headers.extend(extra_headers.clone());

        let mut request = self.http.request(method, url).headers(headers);
        match payload {
            Payload::None => {}
            Payload::Json(body) => request = request.json(body),
            Payload::Form(fields) => request = request.form(fields),
        }
        Ok(request.send().await?)
    }

    /// Send with the 401 recovery path: refresh once, retry once. Any
    /// 401 after the retry is a hard authentication failure.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: &Payload,
        extra_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.absolute_url(path);

        let response = self
            .send_once(method.clone(), &url, payload, extra_headers)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_response(response).await;
        }

        debug!(url = %url, "Request unauthorized, refreshing token");
        self.refresh.ensure_fresh().await?;

        let retry = self.send_once(method, &url, payload, extra_headers).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Still unauthorized after refresh");
            return Err(ApiError::Unauthorized);
        }
        Self::check_response(retry).await
    }

    /// Map non-success statuses to errors; pass successes through.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "Request failed");
        Err(ApiError::from_status(status, &body))
    }

    async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("failed to parse response: {}", e)))
    }

    // ===== Generic requests =====

    pub async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, path, &Payload::None).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.request(Method::POST, path, &Payload::Json(body)).await
    }

    /// Arbitrary method and path, with the full 401 recovery pipeline.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: &Payload,
    ) -> Result<Value, ApiError> {
        self.request_with_headers(method, path, payload, HeaderMap::new())
            .await
    }

    /// [`request`](Self::request) with additional caller headers.
    pub async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        payload: &Payload,
        headers: HeaderMap,
    ) -> Result<Value, ApiError> {
        let response = self.execute(method, path, payload, &headers).await?;
        Self::parse_json(response).await
    }

    /// Resolve an endpoint from the registry and execute it.
    pub async fn request_endpoint(
        &self,
        entity: &str,
        segments: &[&str],
        params: &Params,
        payload: Payload,
    ) -> Result<Value, ApiError> {
        let endpoint = endpoints::resolve(entity, segments, params)?;
        self.request(endpoint.method, &endpoint.path, &payload)
            .await
    }

    /// Multipart upload with the same 401 recovery as [`execute`].
    /// Multipart bodies are single-use, so the caller supplies a
    /// builder that can produce the form again for the retry.
    pub async fn upload<F>(
        &self,
        entity: &str,
        segments: &[&str],
        params: &Params,
        make_form: F,
    ) -> Result<Value, ApiError>
    where
        F: Fn() -> reqwest::multipart::Form,
    {
        let endpoint = endpoints::resolve(entity, segments, params)?;
        let url = self.absolute_url(&endpoint.path);

        let response = self
            .http
            .request(endpoint.method.clone(), &url)
            .headers(self.auth_headers()?)
            .multipart(make_form())
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::parse_json(Self::check_response(response).await?).await;
        }

        debug!(url = %url, "Upload unauthorized, refreshing token");
        self.refresh.ensure_fresh().await?;

        let retry = self
            .http
            .request(endpoint.method, &url)
            .headers(self.auth_headers()?)
            .multipart(make_form())
            .send()
            .await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Self::parse_json(Self::check_response(retry).await?).await
    }

    // ===== Auth flows =====

    /// Exchange credentials for a session. A 401 here is a credential
    /// problem, never a refresh trigger.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let endpoint = endpoints::resolve("auth", &["login"], &Params::new())?;
        let url = self.absolute_url(&endpoint.path);
        let fields = Payload::Form(vec![
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ]);

        let response = self
            .send_once(endpoint.method, &url, &fields, &HeaderMap::new())
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LoginFailed(error_detail(&body)));
        }
        let response = Self::check_response(response).await?;

        let tokens: TokenResponse = Self::parse_json(response).await?;
        match (self.auth_mode, tokens.access_token) {
            (_, Some(access_token)) => {
                self.session
                    .set_tokens(&access_token, tokens.refresh_token.as_deref());
            }
            // Cookie mode may carry everything in the jar.
            (AuthMode::Cookie, None) => {}
            (AuthMode::Bearer, None) => {
                return Err(ApiError::InvalidResponse(
                    "login response missing access_token".to_string(),
                ));
            }
        }
        info!(username = %username, "Logged in");
        Ok(())
    }

    /// Tell the server the session is over, then clear local state.
    /// The server call is best effort; logout always succeeds locally.
    pub async fn logout(&self) {
        if let Ok(endpoint) = endpoints::resolve("auth", &["logout"], &Params::new()) {
            let url = self.absolute_url(&endpoint.path);
            match self
                .send_once(endpoint.method, &url, &Payload::None, &HeaderMap::new())
                .await
            {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = response.status().as_u16(), "Server logout failed");
                }
                Err(e) => warn!(error = %e, "Server logout failed"),
                Ok(_) => {}
            }
        }
        self.session.clear();
    }

    // ===== Typed convenience calls =====

    /// The authenticated account.
    pub async fn me(&self) -> Result<User, ApiError> {
        let endpoint = endpoints::resolve("users", &["me"], &Params::new())?;
        let response = self
            .execute(endpoint.method, &endpoint.path, &Payload::None, &HeaderMap::new())
            .await?;
        Self::parse_json(response).await
    }

    /// Teams the account belongs to.
    pub async fn list_teams(&self) -> Result<Vec<Team>, ApiError> {
        let endpoint = endpoints::resolve("teams", &["list"], &Params::new())?;
        let response = self
            .execute(endpoint.method, &endpoint.path, &Payload::None, &HeaderMap::new())
            .await?;
        Self::parse_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> (ApiClient, Arc<SessionManager>) {
        let session = SessionManager::new(Box::new(MemoryStorage::new()));
        let config = Config {
            api_base: Some(server.url()),
            auth_mode: AuthMode::Bearer,
            last_username: None,
        };
        let client = ApiClient::new(&config, Arc::clone(&session)).unwrap();
        (client, session)
    }

    #[test]
    fn test_absolute_url_passthrough_and_join() {
        let session = SessionManager::new(Box::new(MemoryStorage::new()));
        let config = Config {
            api_base: Some("http://10.0.0.5:8338/".to_string()),
            ..Config::default()
        };
        let client = ApiClient::new(&config, session).unwrap();

        assert_eq!(
            client.absolute_url("/users/me"),
            "http://10.0.0.5:8338/users/me"
        );
        assert_eq!(
            client.absolute_url("https://elsewhere.example/file"),
            "https://elsewhere.example/file"
        );
    }

    #[tokio::test]
    async fn test_bearer_and_team_headers_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users/me")
            .match_header("authorization", "Bearer tok-1")
            .match_header("x-team-id", "t1")
            .match_header("x-team-name", "Research")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"u1","email":"ada@example.com","name":"Ada","is_verified":true}"#)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_access_token(Some("tok-1"));
        session.set_team(Some(Team::new("t1", "Research")));

        let user = client.me().await.unwrap();
        assert_eq!(user.id, "u1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("GET", "/users/me")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh","refresh_token":"ref-2"}"#)
            .expect(1)
            .create_async()
            .await;
        let retry = server
            .mock("GET", "/users/me")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"u1"}"#)
            .expect(1)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_tokens("stale", Some("ref-1"));

        let user = client.me().await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(session.access_token().as_deref(), Some("fresh"));
        stale.assert_async().await;
        refresh.assert_async().await;
        retry.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_hard_failure() {
        let mut server = mockito::Server::new_async().await;
        // Both the original attempt and the post-refresh retry 401.
        let me = server
            .mock("GET", "/users/me")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh"}"#)
            .expect(1)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_tokens("stale", Some("ref-1"));

        let err = client.me().await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        me.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_401_errors_do_not_trigger_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _me = server
            .mock("GET", "/users/me")
            .with_status(500)
            .with_body(r#"{"detail":"database on fire"}"#)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_tokens("tok", Some("ref"));

        let err = client.me().await.unwrap_err();
        match err {
            ApiError::ServerError(detail) => assert_eq!(detail, "database on fire"),
            other => panic!("expected ServerError, got {other:?}"),
        }
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_stores_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/login")
            .match_header(
                "content-type",
                "application/x-www-form-urlencoded",
            )
            .match_body("username=ada&password=hunter2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok","refresh_token":"ref"}"#)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        client.login("ada", "hunter2").await.unwrap();

        assert_eq!(session.access_token().as_deref(), Some("tok"));
        assert_eq!(session.refresh_token().as_deref(), Some("ref"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_401_is_bad_credentials_not_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/auth/login")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"detail":"incorrect username or password"}"#)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let (client, _session) = client_for(&server);
        let err = client.login("ada", "wrong").await.unwrap_err();
        match err {
            ApiError::LoginFailed(detail) => {
                assert_eq!(detail, "incorrect username or password")
            }
            other => panic!("expected LoginFailed, got {other:?}"),
        }
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_clears_session_even_if_server_call_fails() {
        let mut server = mockito::Server::new_async().await;
        let _logout = server
            .mock("POST", "/auth/logout")
            .with_status(500)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_tokens("tok", Some("ref"));

        client.logout().await;
        assert!(session.access_token().is_none());
        assert!(session.refresh_token().is_none());
    }

    #[tokio::test]
    async fn test_request_endpoint_resolves_and_sends() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/experiments/e1/jobs")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":7}]"#)
            .create_async()
            .await;

        let (client, session) = client_for(&server);
        session.set_access_token(Some("tok"));

        let params: Params = [("experiment_id".to_string(), json!("e1"))]
            .into_iter()
            .collect();
        let jobs = client
            .request_endpoint("experiments", &["jobs", "list"], &params, Payload::None)
            .await
            .unwrap();
        assert_eq!(jobs, json!([{"id": 7}]));
        mock.assert_async().await;
    }
}
