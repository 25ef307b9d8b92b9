//! Credential and session types.
//!
//! This module provides:
//! - `Session`, `AccessToken`, `RefreshToken`, `TokenInfo`: the session data model
//! - `CredentialStore`: durable persistence of the three session entries,
//!   backed by a JSON file, the OS keychain, or memory
//!
//! Access tokens are shape-checked at the store boundary; a malformed value
//! is rejected before it reaches any backend.

pub mod credentials;
pub mod session;

pub use credentials::{CredentialKey, CredentialStore, FileStore, KeyringStore, MemoryStore};
pub use session::{
    AccessToken, Credentials, RefreshToken, Session, SessionState, TokenGrant, TokenInfo, User,
    EXPIRING_SOON_SECS,
};
