//! Client configuration and device identity.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, Span};

use crate::retry::RetryPolicy;

/// Production API endpoint used for the token exchange.
pub const API_ENDPOINT: &str = "https://api.litzscore.com";
/// Path of the token exchange, relative to the API endpoint.
pub const AUTH_PATH: &str = "/rest/v2/auth/";
/// Namespace every push session is scoped to.
pub const STREAM_NAMESPACE: &str = "/stream";

/// Default tuning values for [`PushConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PushDefaults;

impl PushDefaults {
    pub const AUTH_FAIL_MAX: u32 = 30;
    pub const AUTH_RETRY: Duration = Duration::from_secs(1);
    pub const CONN_FAIL_MAX: u32 = 30;
    pub const CONN_RETRY: Duration = Duration::from_secs(1);
    /// Longest single wait before the token lifetime is re-checked.
    pub const MAX_WAIT: Duration = Duration::from_secs(12 * 60 * 60);
    /// Buffer subtracted from a token's expiry before it is considered usable.
    pub const EXPIRY_MARGIN: Duration = Duration::from_secs(8 * 60 * 60);
    /// Sessions are never opened or kept with less usable lifetime than this.
    pub const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(120);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Errors raised while assembling a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
}

/// Everything the session manager needs to authenticate and stay connected.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Application access key sent with every token request.
    pub access_key: String,
    /// Application secret key. Only exposed while building the request form.
    pub secret_key: SecretString,
    /// Application id issued alongside the keys.
    pub app_id: String,
    /// Caller-supplied device id; detected from the host when unset.
    pub device_id: Option<String>,
    /// Base URL of the API, without a trailing slash.
    pub api_endpoint: String,
    /// Failure budget and delay for the token exchange.
    pub auth_retry: RetryPolicy,
    /// Failure budget and delay for opening and keeping push connections.
    pub conn_retry: RetryPolicy,
    /// Longest single wait before the token is re-checked. Zero removes the
    /// cap, so the wait runs until the refresh threshold.
    pub max_wait: Duration,
    /// Subtracted from the server-stated expiry of every token.
    pub expiry_margin: Duration,
    /// Usable lifetime a token needs to open or keep a session.
    pub min_token_lifetime: Duration,
    /// Namespace path opened on the push server.
    pub namespace: String,
    /// Timeout for the HTTP connect and the websocket upgrade.
    pub connect_timeout: Duration,
    /// Span the manager's lifecycle logs are recorded under.
    pub span: Option<Span>,
}

impl PushConfig {
    /// Creates a configuration with production defaults.
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: SecretString::new(secret_key.into()),
            app_id: app_id.into(),
            device_id: None,
            api_endpoint: API_ENDPOINT.to_string(),
            auth_retry: RetryPolicy::fixed(PushDefaults::AUTH_FAIL_MAX, PushDefaults::AUTH_RETRY),
            conn_retry: RetryPolicy::fixed(PushDefaults::CONN_FAIL_MAX, PushDefaults::CONN_RETRY),
            max_wait: PushDefaults::MAX_WAIT,
            expiry_margin: PushDefaults::EXPIRY_MARGIN,
            min_token_lifetime: PushDefaults::MIN_TOKEN_LIFETIME,
            namespace: STREAM_NAMESPACE.to_string(),
            connect_timeout: PushDefaults::CONNECT_TIMEOUT,
            span: None,
        }
    }

    /// Reads credentials from `LZPUSH_*` environment variables.
    ///
    /// `LZPUSH_ACCESS_KEY`, `LZPUSH_SECRET_KEY` and `LZPUSH_APP_ID` are
    /// required; `LZPUSH_DEVICE_ID` and `LZPUSH_API_ENDPOINT` are optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
        };

        let mut config = Self::new(
            required("LZPUSH_ACCESS_KEY")?,
            required("LZPUSH_SECRET_KEY")?,
            required("LZPUSH_APP_ID")?,
        );
        if let Ok(device_id) = std::env::var("LZPUSH_DEVICE_ID") {
            config = config.with_device_id(device_id);
        }
        if let Ok(endpoint) = std::env::var("LZPUSH_API_ENDPOINT") {
            config = config.with_api_endpoint(endpoint);
        }
        Ok(config)
    }

    /// Sends `device_id` instead of a detected host identity.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Overrides the API endpoint; trailing slashes and whitespace are dropped.
    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.api_endpoint = endpoint.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Allows `max_failures` retries of the token exchange, `delay` apart.
    pub fn with_auth_retry(mut self, max_failures: u32, delay: Duration) -> Self {
        self.auth_retry = RetryPolicy::fixed(max_failures, delay);
        self
    }

    /// Allows `max_failures` connection failures in a row, `delay` apart.
    pub fn with_conn_retry(mut self, max_failures: u32, delay: Duration) -> Self {
        self.conn_retry = RetryPolicy::fixed(max_failures, delay);
        self
    }

    /// Caps a single wait between token checks. `Duration::ZERO` disables
    /// the cap.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the safety margin taken off every token expiry.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Sets the refresh threshold for the usable token lifetime.
    pub fn with_min_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.min_token_lifetime = lifetime;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Bounds the HTTP connect and the websocket upgrade.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Records the manager's lifecycle events under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Full URL of the token exchange.
    pub fn auth_url(&self) -> String {
        format!("{}{}", self.api_endpoint, AUTH_PATH)
    }

    /// Resolves the device identity, detecting it from the host when unset.
    pub fn device_identity(&self) -> DeviceIdentity {
        match self.device_id.as_deref() {
            Some(device_id) => DeviceIdentity::new(device_id),
            None => DeviceIdentity::detect(),
        }
    }
}

/// Identifier of this client instance, fixed for the life of the manager.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds `<host address>_<unix seconds>` from the local network address.
    pub fn detect() -> Self {
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self(format!("{}_{issued}", host_address()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn host_address() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(err) => {
            debug!(event = "local_ip_unavailable", error = %err);
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "127.0.0.1".to_string())
        }
    }
}
