//! Remote authentication capabilities.
//!
//! The scheduler and controller only see the traits defined here; `ApiClient`
//! implements all of them over HTTP against the analysis backend's
//! `/api/auth/*` endpoints. Tests substitute a scripted fake.

pub mod client;

use async_trait::async_trait;

use crate::auth::{AccessToken, Credentials, RefreshToken, Session, TokenGrant, TokenInfo};
use crate::error::Result;

pub use client::ApiClient;

/// Which refresh endpoint to call. Both share one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    /// Canonical refresh, used on expiry and for recovery
    Full,
    /// Lightweight refresh, used proactively close to expiry
    Quick,
}

impl RefreshKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            RefreshKind::Full => "/auth/refresh",
            RefreshKind::Quick => "/auth/quick-refresh",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RefreshKind::Full => "refresh",
            RefreshKind::Quick => "quick-refresh",
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session>;
}

/// Read-only check of the current access token.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, access_token: &AccessToken) -> Result<TokenInfo>;
}

/// Exchanges a refresh token for a new access token.
///
/// Calls are not single-use server side; redundant calls must be harmless.
#[async_trait]
pub trait RefreshExecutor: Send + Sync {
    async fn refresh(&self, kind: RefreshKind, refresh_token: &RefreshToken) -> Result<TokenGrant>;
}

/// Everything the session subsystem needs from the backend.
pub trait AuthBackend: Authenticator + TokenVerifier + RefreshExecutor {}

impl<T> AuthBackend for T where T: Authenticator + TokenVerifier + RefreshExecutor {}
