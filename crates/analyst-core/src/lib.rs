//! Analyst workspace session core.
//!
//! Keeps an authenticated session alive for the lifetime of the client:
//! login and resume, background token verification and renewal, and the
//! forced logout when renewal becomes impossible. Front ends talk to
//! `SessionController` and listen for `SessionEvent`s.

pub mod api;
pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use api::{ApiClient, AuthBackend, RefreshKind};
pub use auth::{CredentialStore, Credentials, FileStore, KeyringStore, MemoryStore, SessionState, User};
pub use config::{Config, SessionTiming, StorageBackend};
pub use controller::{SessionController, SessionEvent, SESSION_EXPIRED_MESSAGE};
pub use error::{Result, SessionError};
pub use scheduler::{SchedulerState, SessionScheduler};
