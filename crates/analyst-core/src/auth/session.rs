use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Every issued access token is a JWT, whose base64 header starts with this.
const ACCESS_TOKEN_PREFIX: &str = "eyJ";

/// Shortest access token accepted into the store.
const ACCESS_TOKEN_MIN_LENGTH: usize = 50;

/// Remaining lifetime at or below which a token counts as expiring soon.
pub const EXPIRING_SOON_SECS: i64 = 60;

/// Short-lived bearer credential.
///
/// Can only be constructed through `parse`, so any value of this type has
/// passed the structural check.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn parse(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Err(SessionError::MalformedCredential(
                "access token is empty".to_string(),
            ));
        }
        if !value.starts_with(ACCESS_TOKEN_PREFIX) {
            return Err(SessionError::MalformedCredential(
                "access token has an unexpected prefix".to_string(),
            ));
        }
        if value.len() < ACCESS_TOKEN_MIN_LENGTH {
            return Err(SessionError::MalformedCredential(format!(
                "access token is {} bytes, expected at least {}",
                value.len(),
                ACCESS_TOKEN_MIN_LENGTH
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccessToken {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// Tokens never show up in logs.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({}...)", &self.0[..ACCESS_TOKEN_PREFIX.len()])
    }
}

/// Long-lived credential, only ever sent to the two refresh endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(SessionError::MalformedCredential(
                "refresh token is empty".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
}

impl User {
    /// Name to greet the user with
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.username
        } else {
            &self.name
        }
    }
}

/// Username and password submitted at login.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Seconds remaining until expiry, clamped at zero (for display)
    pub fn remaining_seconds(&self) -> i64 {
        self.time_until_expiry().num_seconds().max(0)
    }
}

/// Server-side view of the current access token, as reported by verify.
///
/// A decision input only; nothing here is written back to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub is_expiring_soon: bool,
}

/// Result of a successful refresh or quick refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
}

/// Lifecycle of a session as presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Active,
    ExpiringSoon,
    Expired,
    Terminated,
}

impl SessionState {
    /// Classify a remaining lifetime for display.
    pub fn from_remaining(remaining_seconds: i64) -> Self {
        Self::classify(remaining_seconds, EXPIRING_SOON_SECS)
    }

    /// Like `from_remaining`, with a configurable expiring-soon threshold.
    pub fn classify(remaining_seconds: i64, expiring_soon_secs: i64) -> Self {
        if remaining_seconds <= 0 {
            SessionState::Expired
        } else if remaining_seconds <= expiring_soon_secs {
            SessionState::ExpiringSoon
        } else {
            SessionState::Active
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "signed out",
            SessionState::Active => "active",
            SessionState::ExpiringSoon => "expiring soon",
            SessionState::Expired => "expired",
            SessionState::Terminated => "terminated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_token() -> String {
        format!("eyJhbGciOiJIUzI1NiJ9.{}", "a".repeat(40))
    }

    #[test]
    fn test_access_token_accepts_jwt_shape() {
        let raw = valid_token();
        let token = AccessToken::parse(&raw).unwrap();
        assert_eq!(token.as_str(), raw);
        assert!(raw.parse::<AccessToken>().is_ok());
    }

    #[test]
    fn test_access_token_rejects_malformed_values() {
        assert!(matches!(
            AccessToken::parse(""),
            Err(SessionError::MalformedCredential(_))
        ));
        // right length, wrong prefix
        let wrong_prefix = "x".repeat(80);
        assert!(AccessToken::parse(&wrong_prefix).is_err());
        // right prefix, too short
        assert!(AccessToken::parse("eyJshort").is_err());
        // exactly the minimum length is fine
        let minimum = format!("eyJ{}", "b".repeat(ACCESS_TOKEN_MIN_LENGTH - 3));
        assert!(AccessToken::parse(&minimum).is_ok());
    }

    #[test]
    fn test_debug_output_hides_token() {
        let token = AccessToken::parse(&valid_token()).unwrap();
        let shown = format!("{:?}", token);
        assert!(!shown.contains("aaaa"));

        let refresh = RefreshToken::parse("secret-refresh").unwrap();
        assert!(!format!("{:?}", refresh).contains("secret"));

        let creds = Credentials::new("analyst", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_refresh_token_rejects_blank() {
        assert!(RefreshToken::parse("   ").is_err());
        assert!(RefreshToken::parse("r-123").is_ok());
    }

    #[test]
    fn test_session_state_from_remaining() {
        assert_eq!(SessionState::from_remaining(900), SessionState::Active);
        assert_eq!(SessionState::from_remaining(61), SessionState::Active);
        assert_eq!(SessionState::from_remaining(60), SessionState::ExpiringSoon);
        assert_eq!(SessionState::from_remaining(1), SessionState::ExpiringSoon);
        assert_eq!(SessionState::from_remaining(0), SessionState::Expired);
        assert_eq!(SessionState::from_remaining(-5), SessionState::Expired);
    }

    #[test]
    fn test_session_remaining_seconds_clamps() {
        let session = Session {
            access_token: AccessToken::parse(&valid_token()).unwrap(),
            refresh_token: RefreshToken::parse("r").unwrap(),
            expires_at: Utc::now() - Duration::seconds(30),
            user: User {
                id: 1,
                username: "analyst".into(),
                email: String::new(),
                role: "analyst".into(),
                name: String::new(),
            },
        };
        assert!(session.is_expired());
        assert_eq!(session.remaining_seconds(), 0);
        assert_eq!(session.user.display_name(), "analyst");
    }
}
