//! API client for the analysis backend's authentication endpoints.
//!
//! Every response is converted into a strongly typed `Session`, `TokenInfo`
//! or `TokenGrant` here. A body that does not fit is an error (fail closed);
//! loosely shaped JSON never travels further into the state machine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Authenticator, RefreshExecutor, RefreshKind, TokenVerifier};
use crate::auth::{
    AccessToken, Credentials, RefreshToken, Session, TokenGrant, TokenInfo, User,
    EXPIRING_SOON_SECS,
};
use crate::config::Config;
use crate::error::{Result, SessionError};

// ============================================================================
// Constants
// ============================================================================

/// Path prefix shared by every endpoint
const API_PREFIX: &str = "/api";

const LOGIN_ENDPOINT: &str = "/auth/login";
const VERIFY_ENDPOINT: &str = "/auth/verify";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Epoch values above this are milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Maps a non-success status and body to an error for one endpoint family.
type StatusMapper = fn(StatusCode, &str) -> SessionError;

/// API client for the analysis backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client from the loaded configuration
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a client against an explicit base URL, e.g. a local mock server
    pub fn with_base_url(base_url: &str) -> anyhow::Result<Self> {
        let config = Config {
            api_base_url: base_url.to_string(),
            ..Config::default()
        };
        Self::new(&config)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, endpoint)
    }

    /// Pull the human-readable reason out of a failure body, if there is one.
    fn failure_message(body: &str) -> String {
        serde_json::from_str::<Envelope<serde_json::Value>>(body)
            .ok()
            .and_then(|env| env.message.or(env.error))
            .unwrap_or_else(|| body.to_string())
    }

    /// Send a request, retrying on 429 with exponential backoff, and decode
    /// the JSON envelope of a successful response.
    async fn send<T, B>(
        &self,
        method: Method,
        endpoint: &str,
        bearer: Option<&AccessToken>,
        body: Option<&B>,
        on_failure: StatusMapper,
    ) -> Result<Envelope<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(endpoint);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(token) = bearer {
                request = request.bearer_auth(token.as_str());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                let text = response.text().await?;
                return serde_json::from_str(&text).map_err(|e| {
                    SessionError::InvalidResponse(format!(
                        "Failed to parse response from {}: {}",
                        endpoint, e
                    ))
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(SessionError::RateLimited);
                }
                warn!(endpoint, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            debug!(endpoint, %status, "Request failed");
            return Err(on_failure(status, &Self::failure_message(&body)));
        }
    }
}

#[async_trait]
impl Authenticator for ApiClient {
    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let envelope: Envelope<LoginData> = self
            .send(
                Method::POST,
                LOGIN_ENDPOINT,
                None,
                Some(credentials),
                SessionError::from_status,
            )
            .await?;

        let data = envelope.into_data(SessionError::Unauthorized)?;
        data.into_session(Utc::now())
    }
}

#[async_trait]
impl TokenVerifier for ApiClient {
    async fn verify(&self, access_token: &AccessToken) -> Result<TokenInfo> {
        let envelope: Envelope<VerifyData> = self
            .send::<_, ()>(
                Method::GET,
                VERIFY_ENDPOINT,
                Some(access_token),
                None,
                SessionError::from_status,
            )
            .await?;

        let data = envelope.into_data(SessionError::Unauthorized)?;
        data.token_info.into_token_info(Utc::now())
    }
}

#[async_trait]
impl RefreshExecutor for ApiClient {
    async fn refresh(&self, kind: RefreshKind, refresh_token: &RefreshToken) -> Result<TokenGrant> {
        let body = RefreshRequest {
            refresh_token: refresh_token.as_str(),
        };
        let envelope: Envelope<RefreshData> = self
            .send(
                Method::POST,
                kind.endpoint(),
                None,
                Some(&body),
                SessionError::from_refresh_status,
            )
            .await?;

        let data = envelope.into_data(SessionError::InvalidRefreshToken)?;
        data.into_grant(Utc::now())
    }
}

// ============================================================================
// Wire types - internal only
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
    error: Option<String>,
}

impl<T> Envelope<T> {
    /// Unwrap `data`, turning `success: false` into the endpoint's rejection.
    fn into_data(self, rejected: fn(String) -> SessionError) -> Result<T> {
        if !self.success {
            let reason = self
                .error
                .or(self.message)
                .unwrap_or_else(|| "request was not successful".to_string());
            return Err(rejected(reason));
        }
        self.data
            .ok_or_else(|| SessionError::InvalidResponse("response has no data".to_string()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    user: User,
    tokens: LoginTokens,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginTokens {
    access_token: String,
    refresh_token: String,
    expires_at: Option<serde_json::Value>,
    remaining_time: Option<i64>,
    expires_in: Option<serde_json::Value>,
}

impl LoginData {
    fn into_session(self, now: DateTime<Utc>) -> Result<Session> {
        let remaining = self
            .tokens
            .remaining_time
            .or_else(|| self.tokens.expires_in.as_ref().and_then(parse_duration_secs));
        let (expires_at, _) = resolve_expiry(self.tokens.expires_at.as_ref(), remaining, now)?;
        Ok(Session {
            access_token: AccessToken::parse(&self.tokens.access_token)?,
            refresh_token: RefreshToken::parse(&self.tokens.refresh_token)?,
            expires_at,
            user: self.user,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyData {
    token_info: TokenInfoApi,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenInfoApi {
    expires_at: Option<serde_json::Value>,
    remaining_time: Option<i64>,
    is_expiring_soon: Option<bool>,
}

impl TokenInfoApi {
    fn into_token_info(self, now: DateTime<Utc>) -> Result<TokenInfo> {
        let (expires_at, remaining_seconds) =
            resolve_expiry(self.expires_at.as_ref(), self.remaining_time, now)?;
        Ok(TokenInfo {
            expires_at,
            remaining_seconds,
            is_expiring_soon: self
                .is_expiring_soon
                .unwrap_or(remaining_seconds <= EXPIRING_SOON_SECS),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: String,
    expires_at: Option<serde_json::Value>,
    remaining_time: Option<i64>,
}

impl RefreshData {
    fn into_grant(self, now: DateTime<Utc>) -> Result<TokenGrant> {
        let (expires_at, remaining_seconds) =
            resolve_expiry(self.expires_at.as_ref(), self.remaining_time, now)?;
        Ok(TokenGrant {
            access_token: AccessToken::parse(&self.access_token)?,
            expires_at,
            remaining_seconds,
        })
    }
}

/// Parse an absolute timestamp: RFC 3339 text, or epoch seconds/milliseconds.
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        serde_json::Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Parse a relative lifetime such as `900`, `"900"`, `"15m"`, `"1h"`.
fn parse_duration_secs(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            let s = s.trim();
            let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
                Some((idx, _)) => s.split_at(idx),
                None => (s, ""),
            };
            let amount: i64 = digits.parse().ok()?;
            let scale = match unit {
                "" | "s" => 1,
                "m" => 60,
                "h" => 3600,
                "d" => 86_400,
                _ => return None,
            };
            amount.checked_mul(scale)
        }
        _ => None,
    }
}

/// Combine the absolute and relative expiry fields into one consistent pair.
///
/// The server's `remainingTime` wins for the countdown when present; the
/// absolute timestamp is derived from it when missing. Neither present is a
/// malformed response.
fn resolve_expiry(
    expires_at: Option<&serde_json::Value>,
    remaining: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, i64)> {
    let absolute = match expires_at {
        Some(serde_json::Value::Null) | None => None,
        Some(value) => Some(parse_timestamp(value).ok_or_else(|| {
            SessionError::InvalidResponse(format!("unrecognized expiresAt value: {}", value))
        })?),
    };

    match (absolute, remaining) {
        (Some(at), Some(secs)) => Ok((at, secs)),
        (Some(at), None) => Ok((at, (at - now).num_seconds())),
        (None, Some(secs)) => chrono::Duration::try_seconds(secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .map(|at| (at, secs))
            .ok_or_else(|| {
                SessionError::InvalidResponse(format!("remaining time out of range: {}", secs))
            }),
        (None, None) => Err(SessionError::InvalidResponse(
            "response carries no expiry information".to_string(),
        )),
    }
}
