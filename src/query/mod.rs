//! Cached data fetching over the API client.
//!
//! [`QueryClient`] is the read path the UI layers sit on: it resolves
//! an endpoint, serves fresh results from an in-memory cache, and
//! folds authentication failures into a value ([`QueryOutcome`]) so
//! screens can render a login prompt instead of an error page.
//!
//! Cache entries are keyed by the active team id as well as the request
//! itself, so switching teams stops serving the old team's data without
//! flushing anything.
//!
//! A query whose params are not all known yet (a screen still waiting
//! on a selection) returns [`QueryOutcome::NotReady`] without touching
//! the network.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, Payload};
use crate::endpoints::{self, Params, ResolvedEndpoint};

/// How long a cached result is served before the next query refetches
const DEFAULT_MAX_AGE_SECS: u64 = 30;

/// Query params where a `None` value means "not known yet". A query
/// with any unknown param is suppressed entirely.
pub type QueryParams = HashMap<String, Option<Value>>;

/// What a query produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// One or more params are unknown; nothing was fetched.
    NotReady,
    /// Authentication is gone and could not be refreshed. Render the
    /// login prompt.
    Unauthorized,
    Data(Value),
}

struct CachedEntry {
    value: Value,
    cached_at: DateTime<Utc>,
}

impl CachedEntry {
    fn is_fresh(&self, max_age_secs: u64) -> bool {
        Utc::now() - self.cached_at < chrono::Duration::seconds(max_age_secs as i64)
    }
}

pub struct QueryClient {
    api: ApiClient,
    cache: RwLock<HashMap<String, CachedEntry>>,
    max_age_secs: u64,
}

impl QueryClient {
    pub fn new(api: ApiClient) -> Arc<Self> {
        Self::with_max_age(api, DEFAULT_MAX_AGE_SECS)
    }

    pub fn with_max_age(api: ApiClient, max_age_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            api,
            cache: RwLock::new(HashMap::new()),
            max_age_secs,
        })
    }

    /// Fetch an endpoint's data, serving a fresh cached copy when one
    /// exists for the active team.
    pub async fn query(
        &self,
        entity: &str,
        segments: &[&str],
        params: &QueryParams,
    ) -> Result<QueryOutcome, ApiError> {
        let Some(params) = materialize(params) else {
            debug!(entity, "Query suppressed, params not ready");
            return Ok(QueryOutcome::NotReady);
        };
        let endpoint = endpoints::resolve(entity, segments, &params)?;
        let key = self.cache_key(&endpoint);

        if let Some(value) = self.cached_fresh(&key) {
            debug!(key = %key, "Query served from cache");
            return Ok(QueryOutcome::Data(value));
        }
        self.fetch_and_store(endpoint, key).await
    }

    /// Fetch an endpoint's data, bypassing and replacing any cached
    /// copy. Call after a mutation to pick up the server's new state.
    pub async fn revalidate(
        &self,
        entity: &str,
        segments: &[&str],
        params: &QueryParams,
    ) -> Result<QueryOutcome, ApiError> {
        let Some(params) = materialize(params) else {
            return Ok(QueryOutcome::NotReady);
        };
        let endpoint = endpoints::resolve(entity, segments, &params)?;
        let key = self.cache_key(&endpoint);
        self.fetch_and_store(endpoint, key).await
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .expect("query cache lock poisoned")
            .clear();
    }

    /// Re-fetch an endpoint on an interval, delivering each outcome
    /// through the returned handle. Dropping the handle stops polling.
    pub fn poll(
        self: &Arc<Self>,
        entity: &str,
        segments: &[&str],
        params: &QueryParams,
        interval: Duration,
    ) -> PollHandle {
        let client = Arc::clone(self);
        let entity = entity.to_string();
        let segments: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
        let params = params.clone();
        let (tx, rx) = watch::channel(QueryOutcome::NotReady);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                match client.revalidate(&entity, &segments, &params).await {
                    Ok(outcome) => {
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                    // Transient failures keep the last delivered value.
                    Err(e) => warn!(entity = %entity, error = %e, "Poll fetch failed"),
                }
            }
        });

        PollHandle { rx, task }
    }

    // ===== Internals =====

    /// Cache key: team scope plus the concrete request. A team switch
    /// changes the key, so stale cross-team reads are impossible.
    fn cache_key(&self, endpoint: &ResolvedEndpoint) -> String {
        let team_id = self
            .api
            .session()
            .team()
            .map(|t| t.id)
            .unwrap_or_else(|| "-".to_string());
        format!("{}:{} {}", team_id, endpoint.method, endpoint.path)
    }

    fn cached_fresh(&self, key: &str) -> Option<Value> {
        let cache = self.cache.read().expect("query cache lock poisoned");
        cache
            .get(key)
            .filter(|entry| entry.is_fresh(self.max_age_secs))
            .map(|entry| entry.value.clone())
    }

    async fn fetch_and_store(
        &self,
        endpoint: ResolvedEndpoint,
        key: String,
    ) -> Result<QueryOutcome, ApiError> {
        let result = self
            .api
            .request(endpoint.method, &endpoint.path, &Payload::None)
            .await;
        match result {
            Ok(value) => {
                self.cache.write().expect("query cache lock poisoned").insert(
                    key,
                    CachedEntry {
                        value: value.clone(),
                        cached_at: Utc::now(),
                    },
                );
                Ok(QueryOutcome::Data(value))
            }
            // Unrecoverable auth failures are a rendering state, not an
            // error: the screen shows the login prompt.
            Err(ApiError::Unauthorized) | Err(ApiError::RefreshFailed(_)) => {
                Ok(QueryOutcome::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }
}

/// Convert params to concrete values, or `None` if any is unknown.
fn materialize(params: &QueryParams) -> Option<Params> {
    params
        .iter()
        .map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .collect()
}

/// Running poll task. Dropping the handle aborts the task.
pub struct PollHandle {
    rx: watch::Receiver<QueryOutcome>,
    task: tokio::task::JoinHandle<()>,
}

impl PollHandle {
    /// Most recent outcome delivered by the poll task.
    pub fn outcome(&self) -> QueryOutcome {
        self.rx.borrow().clone()
    }

    /// Wait for the next delivered outcome.
    pub async fn changed(&mut self) -> QueryOutcome {
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
