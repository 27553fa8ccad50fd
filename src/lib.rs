//! Client library for the experiment platform's backend API.
//!
//! The pieces compose at the application's startup, in order:
//!
//! 1. [`config::Config`] is loaded from disk,
//! 2. a credential storage backend is chosen by
//!    [`auth::detect_storage`],
//! 3. an [`auth::SessionManager`] hydrates session state from it,
//! 4. an [`api::ApiClient`] wraps the HTTP pipeline (auth headers,
//!    single-flight token refresh, 401 retry) around that session,
//! 5. a [`query::QueryClient`] adds the cached read path the UI sits
//!    on.
//!
//! ```no_run
//! use std::sync::Arc;
//! use labclient::{api::ApiClient, auth, config::Config, query::QueryClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let storage = auth::detect_storage(config.cache_dir()?);
//! let session = auth::SessionManager::new(storage);
//! let api = ApiClient::new(&config, Arc::clone(&session))?;
//! let queries = QueryClient::new(api);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod endpoints;
pub mod models;
pub mod query;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionManager, SessionState};
pub use config::Config;
pub use query::{QueryClient, QueryOutcome};
