//! Authentication: credential storage, session state, token refresh.

pub mod refresh;
pub mod session;
pub mod storage;

pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{SessionManager, SessionState};
pub use storage::{detect_storage, CredentialStorage, FileStorage, KeyringStorage, MemoryStorage};
