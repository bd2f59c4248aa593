//! OAuth2 refresh-token authentication for the drive API.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{normalize, CloudDriveError, ErrorCode, InvalidStatus, Result};
use crate::models::{Credentials, OAuthErrorResponse, TokenResponse};

/// Amazon OAuth2 token endpoint.
pub const TOKEN_URI: &str = "https://api.amazon.com/auth/o2/token";

/// Tokens expiring within this window are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

/// Upper bound on the lifetime accepted from the token endpoint.
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 60 * 60;

/// Callback invoked with the new credentials after every successful refresh.
pub type RefreshHook = Arc<dyn Fn(&Credentials) + Send + Sync>;

/// Authenticator holding the OAuth2 credentials of one account.
///
/// Clones share the same credential state, so a refresh performed through
/// one clone is visible to all of them.
#[derive(Clone)]
pub struct Authenticator {
    credentials: Arc<RwLock<Credentials>>,
    refresh_lock: Arc<Mutex<()>>,
    client: Client,
    token_uri: String,
    on_refresh: Option<RefreshHook>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("token_uri", &self.token_uri)
            .field("on_refresh", &self.on_refresh.is_some())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create a new authenticator from a credentials JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let credentials: Credentials = serde_json::from_str(&content)?;
        Ok(Self::new(credentials))
    }

    /// Create a new authenticator from credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(RwLock::new(credentials)),
            refresh_lock: Arc::new(Mutex::new(())),
            client: Client::new(),
            token_uri: TOKEN_URI.to_string(),
            on_refresh: None,
        }
    }

    /// Use the given HTTP client for token refreshes.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Override the token endpoint.
    pub fn with_token_uri(mut self, uri: impl Into<String>) -> Self {
        self.token_uri = uri.into();
        self
    }

    /// Register a callback fired after each successful refresh, e.g. to persist tokens.
    ///
    /// The hook runs on the async runtime while the refresh lock is held, so it
    /// should return quickly. Hand slow or blocking work to
    /// [`tokio::task::spawn_blocking`].
    pub fn on_refresh<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Credentials) + Send + Sync + 'static,
    {
        self.on_refresh = Some(Arc::new(hook));
        self
    }

    /// Snapshot of the current credentials.
    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn valid_token(&self) -> Result<String> {
        {
            let credentials = self.credentials.read().await;
            if !needs_refresh(&credentials, Utc::now()) {
                return Ok(credentials.access_token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        {
            let credentials = self.credentials.read().await;
            if !needs_refresh(&credentials, Utc::now()) {
                debug!("Token refreshed by a concurrent caller");
                return Ok(credentials.access_token.clone());
            }
        }

        self.refresh_locked().await
    }

    /// Refresh the access token regardless of its expiry.
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Performs the refresh. Callers must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<String> {
        info!("Refreshing access token");

        let current = self.credentials.read().await.clone();
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", current.client_id.as_str()),
            ("client_secret", current.client_secret.as_str()),
            ("redirect_uri", current.redirect_uri.as_str()),
            ("refresh_token", current.refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_uri)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let headers = response.headers().clone();
            let content = match response.text().await {
                Ok(content) => content,
                Err(e) => {
                    debug!(error = %e, "Failed to read token error body");
                    String::new()
                }
            };
            warn!(status = status.as_u16(), "Token refresh failed");
            return Err(refresh_error(InvalidStatus {
                expected: vec![StatusCode::OK],
                got: status,
                content,
                headers,
            }));
        }

        let body = response.text().await?;
        let token: TokenResponse = serde_json::from_str(&body)?;

        let updated = {
            let mut credentials = self.credentials.write().await;
            credentials.access_token = token.access_token;
            if let Some(refresh_token) = token.refresh_token {
                credentials.refresh_token = refresh_token;
            }
            credentials.expires_at = expiry_after(Utc::now(), token.expires_in);
            credentials.clone()
        };

        info!(expires_at = %updated.expires_at, "Successfully refreshed access token");

        if let Some(hook) = &self.on_refresh {
            hook(&updated);
        }

        Ok(updated.access_token)
    }
}

/// Expiry of a token issued at `now` and valid for `expires_in` seconds.
///
/// The lifetime is clamped to `[0, MAX_EXPIRES_IN_SECS]`.
fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    let lifetime = Duration::try_seconds(expires_in.clamp(0, MAX_EXPIRES_IN_SECS))
        .unwrap_or_else(Duration::zero);
    now.checked_add_signed(lifetime).unwrap_or(now)
}

fn needs_refresh(credentials: &Credentials, now: DateTime<Utc>) -> bool {
    now > credentials.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
}

/// Normalize a failed refresh, preferring the OAuth error fields when present.
fn refresh_error(raw: InvalidStatus) -> CloudDriveError {
    let oauth = serde_json::from_str::<OAuthErrorResponse>(&raw.content).ok();
    let mut err = normalize(raw);
    if let Some(oauth) = oauth {
        err.code = ErrorCode::from_wire(&oauth.error);
        err.message = oauth.error_description;
    }
    CloudDriveError::Api(err)
}

impl Credentials {
    /// Load credentials from `CLOUDDRIVE_*` environment variables.
    ///
    /// `CLOUDDRIVE_EXPIRES_AT` is a Unix timestamp in milliseconds.
    pub fn from_env() -> Result<Self> {
        fn var(name: &str) -> Result<String> {
            env::var(name).map_err(|_| CloudDriveError::MissingEnvVar(name.to_string()))
        }

        let expires_at_ms: i64 = var("CLOUDDRIVE_EXPIRES_AT")?
            .parse()
            .map_err(|_| CloudDriveError::MissingEnvVar("CLOUDDRIVE_EXPIRES_AT".to_string()))?;

        Ok(Self {
            client_id: var("CLOUDDRIVE_CLIENT_ID")?,
            client_secret: var("CLOUDDRIVE_CLIENT_SECRET")?,
            redirect_uri: var("CLOUDDRIVE_REDIRECT_URI")?,
            access_token: var("CLOUDDRIVE_ACCESS_TOKEN")?,
            refresh_token: var("CLOUDDRIVE_REFRESH_TOKEN")?,
            expires_at: DateTime::from_timestamp_millis(expires_at_ms).unwrap_or_default(),
        })
    }
}
