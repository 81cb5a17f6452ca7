//! Token exchange against the push API and tracking of the held token.
//!
//! [`TokenFetcher`] performs the form POST through the [`AuthHttp`] seam and
//! retries recoverable failures under the authentication
//! [`FailureCounter`]. [`TokenStore`] keeps the accepted token and answers
//! whether it still has enough lifetime to open or keep a session.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{DeviceIdentity, PushConfig};
use crate::retry::{retry_async, FailureCounter, RetryError, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Longest lifetime a token is tracked with, whatever the server states.
const MAX_TRACKED_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// One streaming endpoint granted by the token exchange.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
pub struct PushServer {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
}

impl PushServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PushServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Access token issued by the token exchange. Replaced wholesale on refresh.
#[derive(Clone, Debug)]
pub struct AccessToken {
    token: SecretString,
    expires: SystemTime,
    push_servers: Vec<PushServer>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires: SystemTime, push_servers: Vec<PushServer>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            expires,
            push_servers,
        }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Wall-clock expiry stated by the server.
    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    pub fn push_servers(&self) -> &[PushServer] {
        &self.push_servers
    }

    /// The server sessions connect to. Failover to the others is not attempted.
    pub fn primary_server(&self) -> Option<&PushServer> {
        self.push_servers.first()
    }
}

#[derive(Debug)]
struct HeldToken {
    token: AccessToken,
    expires_at: Instant,
}

/// Holds the current token and decides when it must be refreshed.
///
/// Expiry is tracked on the monotonic clock: the remaining wall-clock
/// lifetime is converted to an [`Instant`] when the token is accepted.
#[derive(Debug)]
pub struct TokenStore {
    current: Option<HeldToken>,
    margin: Duration,
    min_lifetime: Duration,
}

impl TokenStore {
    /// `margin` is subtracted from every expiry; a token is usable while more
    /// than `min_lifetime` remains after that.
    pub fn new(margin: Duration, min_lifetime: Duration) -> Self {
        Self {
            current: None,
            margin,
            min_lifetime,
        }
    }

    /// Accepts a freshly fetched token, replacing any previous one.
    pub fn store(&mut self, token: AccessToken) {
        self.store_at(token, SystemTime::now(), Instant::now());
    }

    /// Accepts `token` as observed at (`wall_now`, `now`).
    pub fn store_at(&mut self, token: AccessToken, wall_now: SystemTime, now: Instant) {
        let lifetime = token
            .expires
            .duration_since(wall_now)
            .unwrap_or(Duration::ZERO)
            .min(MAX_TRACKED_LIFETIME);
        let expires_at = now
            .checked_add(lifetime)
            .unwrap_or_else(|| now + Duration::from_secs(24 * 60 * 60));
        self.current = Some(HeldToken { token, expires_at });
    }

    /// Lifetime left after the safety margin, or `None` without a token.
    pub fn usable_lifetime(&self, now: Instant) -> Option<Duration> {
        let held = self.current.as_ref()?;
        Some(
            held.expires_at
                .checked_duration_since(now)
                .unwrap_or(Duration::ZERO)
                .saturating_sub(self.margin),
        )
    }

    /// Returns the held token if it can still open or keep a session.
    pub fn get_valid_token(&self, now: Instant) -> Option<&AccessToken> {
        let lifetime = self.usable_lifetime(now)?;
        if lifetime > self.min_lifetime {
            self.current.as_ref().map(|held| &held.token)
        } else {
            None
        }
    }

    /// Returns `true` when a token is held but no longer usable.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.current.is_some() && self.get_valid_token(now).is_none()
    }

    /// Drops the held token so the next connect attempt refetches.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    pub fn min_lifetime(&self) -> Duration {
        self.min_lifetime
    }
}

/// Response of one HTTP exchange.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Recoverable I/O failure of the HTTP layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct HttpIoError(pub String);

/// Request/response seam used for the token exchange.
#[async_trait]
pub trait AuthHttp: Send + Sync {
    /// Posts `form` url-encoded to `url`.
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, HttpIoError>;
}

/// [`AuthHttp`] implementation backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct ReqwestAuthHttp {
    http: Client,
}

impl ReqwestAuthHttp {
    pub fn new(connect_timeout: Duration) -> Result<Self, AuthError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| AuthError::Client(err.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AuthHttp for ReqwestAuthHttp {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, HttpIoError> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|err| HttpIoError(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| HttpIoError(err.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Errors produced by the token exchange.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Transport(#[from] HttpIoError),

    #[error("auth endpoint returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("malformed auth response: {0}")]
    Malformed(String),

    #[error("no push access: the application has no rights for push streaming")]
    NoPushAccess,

    #[error("token fetch failed after {failures} attempts: {last}")]
    RetriesExhausted { failures: u32, last: Box<AuthError> },

    #[error("failed to build http client: {0}")]
    Client(String),
}

impl AuthError {
    /// Transport failures, server errors and throttling are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Malformed(_) | Self::NoPushAccess | Self::RetriesExhausted { .. } | Self::Client(_) => {
                false
            }
        }
    }
}

/// Performs the token exchange with bounded fixed-delay retries.
#[derive(Debug)]
pub struct TokenFetcher<H> {
    http: H,
    url: String,
    access_key: String,
    secret_key: SecretString,
    app_id: String,
    device: DeviceIdentity,
    policy: RetryPolicy,
    failures: FailureCounter,
}

impl<H: AuthHttp> TokenFetcher<H> {
    pub fn new(http: H, config: &PushConfig, device: DeviceIdentity) -> Self {
        Self {
            http,
            url: config.auth_url(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            app_id: config.app_id.clone(),
            device,
            policy: config.auth_retry,
            failures: config.auth_retry.counter(),
        }
    }

    /// Authentication failure counter; reset by every successful fetch.
    pub fn failures(&self) -> FailureCounter {
        self.failures
    }

    /// Counts a fetched token that turned out to be unusable on top of
    /// `before`, the counter as it was when the fetch started. Returns `true`
    /// while another fetch is allowed.
    pub(crate) fn reject_token(&mut self, before: FailureCounter) -> bool {
        self.failures = before;
        self.failures.record_failure()
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        self.policy.delay
    }

    /// Fetches a new token.
    ///
    /// Recoverable failures are retried until the counter is exhausted, which
    /// yields [`AuthError::RetriesExhausted`]. Any other error is final.
    pub async fn fetch(&mut self) -> Result<AccessToken, AuthError> {
        let form = [
            ("access_key", self.access_key.as_str()),
            ("secret_key", self.secret_key.expose_secret().as_str()),
            ("app_id", self.app_id.as_str()),
            ("device_id", self.device.as_str()),
        ];
        let form = &form[..];
        let http = &self.http;
        let url = self.url.as_str();

        let result = retry_async(
            &self.policy,
            &mut self.failures,
            move |attempt| async move { request_token(http, url, form, attempt).await },
            AuthError::is_retryable,
        )
        .await;

        match result {
            Ok(token) => {
                info!(
                    event = "access_token_issued",
                    push_servers = token.push_servers.len()
                );
                Ok(token)
            }
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { failures, last }) => {
                error!(event = "access_token_retries_exhausted", failures, error = %last);
                Err(AuthError::RetriesExhausted {
                    failures,
                    last: Box::new(last),
                })
            }
        }
    }
}

async fn request_token<H: AuthHttp>(
    http: &H,
    url: &str,
    form: &[(&str, &str)],
    attempt: u32,
) -> Result<AccessToken, AuthError> {
    let reply = match http.post_form(url, form).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(event = "access_token_request_failed", attempt, error = %err);
            return Err(AuthError::Transport(err));
        }
    };

    if reply.status != 200 {
        error!(
            event = "access_token_bad_response",
            attempt,
            status = reply.status,
            body = %reply.body
        );
        return Err(AuthError::HttpStatus {
            status: reply.status,
            body: summarize_error_body(&reply.body),
        });
    }

    parse_auth_response(&reply.body)
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    auth: AuthBody,
}

#[derive(Debug, Deserialize)]
struct AuthBody {
    #[serde(default)]
    access_token: String,
    expires: NumberOrText,
    #[serde(default)]
    push_servers: Option<Vec<PushServer>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

pub(crate) fn parse_auth_response(body: &str) -> Result<AccessToken, AuthError> {
    let envelope: AuthEnvelope =
        serde_json::from_str(body).map_err(|err| AuthError::Malformed(err.to_string()))?;
    let auth = envelope.auth;

    let expires = auth
        .expires
        .as_f64()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .and_then(|since_epoch| UNIX_EPOCH.checked_add(since_epoch))
        .ok_or_else(|| AuthError::Malformed("auth.expires is not a unix timestamp".to_string()))?;

    let push_servers = match auth.push_servers {
        Some(servers) if !servers.is_empty() => servers,
        _ => return Err(AuthError::NoPushAccess),
    };

    Ok(AccessToken::new(
        auth.access_token,
        expires,
        push_servers,
    ))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
