//! Session state: token cache, team scope, and change notification.
//!
//! [`SessionManager`] owns the credentials for the current session. The
//! in-memory cache is authoritative; the injected storage backend is a
//! best-effort mirror whose failures are logged and swallowed, so a
//! broken keychain or full disk never breaks an active session.
//!
//! Subscribers observe state through a `tokio::sync::watch` channel:
//! every write updates the cache, persists, then broadcasts a snapshot
//! on the same call, so observers see the new state immediately.

use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::storage::CredentialStorage;
use crate::models::Team;

/// Storage keys for the persisted pieces of session state
const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const TEAM_KEY: &str = "team";

/// Snapshot of the credential/session state at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub team: Option<Team>,
}

impl SessionState {
    /// True when a bearer credential is present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

/// Owner of session credentials and the active team selection.
///
/// Constructed once at the application's composition root with an
/// injected storage backend, then shared (via `Arc`) with the API
/// client and any observers.
pub struct SessionManager {
    storage: Box<dyn CredentialStorage>,
    state: RwLock<SessionState>,
    tx: watch::Sender<SessionState>,
}

impl SessionManager {
    /// Create a manager, hydrating the in-memory cache from storage.
    pub fn new(storage: Box<dyn CredentialStorage>) -> Arc<Self> {
        let state = SessionState {
            access_token: Self::read_key(storage.as_ref(), ACCESS_TOKEN_KEY),
            refresh_token: Self::read_key(storage.as_ref(), REFRESH_TOKEN_KEY),
            team: Self::read_key(storage.as_ref(), TEAM_KEY)
                .and_then(|raw| match serde_json::from_str(&raw) {
                    Ok(team) => Some(team),
                    Err(e) => {
                        warn!(error = %e, "Discarding unparseable persisted team");
                        None
                    }
                }),
        };
        debug!(
            authenticated = state.is_authenticated(),
            team = state.team.as_ref().map(|t| t.id.as_str()),
            "Session hydrated from storage"
        );

        let (tx, _) = watch::channel(state.clone());
        Arc::new(Self {
            storage,
            state: RwLock::new(state),
            tx,
        })
    }

    fn read_key(storage: &dyn CredentialStorage, key: &str) -> Option<String> {
        match storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, store = storage.name(), error = %e, "Failed to read persisted credential");
                None
            }
        }
    }

    // ===== Reads =====

    pub fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.snapshot().refresh_token
    }

    pub fn team(&self) -> Option<Team> {
        self.snapshot().team
    }

    /// Current state as an owned snapshot.
    pub fn snapshot(&self) -> SessionState {
        self.state
            .read()
            .expect("session state lock poisoned")
            .clone()
    }

    /// Observe session changes. Each write broadcasts the full new
    /// state; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    // ===== Writes =====

    pub fn set_access_token(&self, token: Option<&str>) {
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.access_token = token.map(str::to_owned);
        }
        self.persist(ACCESS_TOKEN_KEY, token);
        self.notify();
    }

    pub fn set_refresh_token(&self, token: Option<&str>) {
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.refresh_token = token.map(str::to_owned);
        }
        self.persist(REFRESH_TOKEN_KEY, token);
        self.notify();
    }

    /// Store a fresh access token and, when the server rotated it, the
    /// new refresh token — one write, one notification, so observers
    /// never see a half-rotated pair.
    pub fn set_tokens(&self, access_token: &str, refresh_token: Option<&str>) {
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            state.access_token = Some(access_token.to_owned());
            if let Some(refresh) = refresh_token {
                state.refresh_token = Some(refresh.to_owned());
            }
        }
        self.persist(ACCESS_TOKEN_KEY, Some(access_token));
        if refresh_token.is_some() {
            self.persist(REFRESH_TOKEN_KEY, refresh_token);
        }
        self.notify();
    }

    /// Select the active team. Switching to a different team id is a
    /// global event; consumers key caches by team id so the old team's
    /// data stops being served without a full reload.
    pub fn set_team(&self, team: Option<Team>) {
        let previous_id = {
            let mut state = self.state.write().expect("session state lock poisoned");
            let previous = state.team.as_ref().map(|t| t.id.clone());
            state.team = team.clone();
            previous
        };

        match &team {
            Some(team) => {
                if previous_id.as_deref() != Some(team.id.as_str()) {
                    info!(team_id = %team.id, team_name = %team.name, "Active team changed");
                }
                match serde_json::to_string(team) {
                    Ok(raw) => self.persist(TEAM_KEY, Some(&raw)),
                    Err(e) => warn!(error = %e, "Failed to serialize team for persistence"),
                }
            }
            None => self.persist(TEAM_KEY, None),
        }
        self.notify();
    }

    /// Drop all credentials and the team selection (logout).
    pub fn clear(&self) {
        {
            let mut state = self.state.write().expect("session state lock poisoned");
            *state = SessionState::default();
        }
        self.persist(ACCESS_TOKEN_KEY, None);
        self.persist(REFRESH_TOKEN_KEY, None);
        self.persist(TEAM_KEY, None);
        info!("Session cleared");
        self.notify();
    }

    // ===== Internals =====

    /// Best-effort mirror to the backing store. `None` deletes the key
    /// outright so cleared credentials read back as absent.
    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.storage.set(key, value),
            None => self.storage.delete(key),
        };
        if let Err(e) = result {
            warn!(key, store = self.storage.name(), error = %e, "Failed to persist credential");
        }
    }

    fn notify(&self) {
        // send() only fails with no receivers, which is fine: the state
        // is still readable through snapshot().
        let _ = self.tx.send(self.snapshot());
    }
}
