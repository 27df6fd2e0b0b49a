//! Yahoo OAuth2 token lifecycle.
//!
//! Loads the credential file written by the interactive login flow
//! (consumer key/secret plus access and refresh tokens), refreshes the
//! access token before it expires and writes refreshed tokens back to the
//! file. Token material is held as [`SecretString`] and only exposed at
//! the point where a request header is built.

use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::FetchError;

pub const DEFAULT_TOKEN_URL: &str = "https://api.login.yahoo.com/oauth2/get_token";

/// Yahoo access tokens live for one hour.
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the recorded expiry.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Credential file layout, compatible with the `yahoo_oauth` JSON format.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    consumer_key: String,
    consumer_secret: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Unix seconds at which `access_token` was issued.
    #[serde(default)]
    token_time: Option<f64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    guid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    xoauth_yahoo_guid: Option<String>,
}

struct TokenState {
    consumer_key: String,
    consumer_secret: SecretString,
    access_token: Option<SecretString>,
    refresh_token: SecretString,
    expires_at: DateTime<Utc>,
    token_type: Option<String>,
    guid: Option<String>,
}

impl TokenState {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_none() || now + Duration::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

/// Owns the OAuth tokens and hands out a valid bearer token on demand.
pub struct TokenManager {
    path: PathBuf,
    token_url: String,
    http: Client,
    state: Mutex<TokenState>,
}

impl TokenManager {
    /// Load credentials from `path`.
    ///
    /// A missing file or a file without a refresh token is an
    /// authentication failure: the interactive login has not been run.
    pub fn load(path: impl AsRef<Path>, token_url: &str, http: Client) -> Result<Self, FetchError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            FetchError::Auth(format!("cannot read credentials file {}: {e}", path.display()))
        })?;
        let file: CredentialFile = serde_json::from_str(&raw).map_err(|e| {
            FetchError::Auth(format!("invalid credentials file {}: {e}", path.display()))
        })?;

        let refresh_token = file.refresh_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            FetchError::Auth(format!(
                "no refresh token in {}; complete the Yahoo login first",
                path.display()
            ))
        })?;

        let expires_at = file
            .token_time
            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
            .map(|issued| issued + Duration::seconds(TOKEN_LIFETIME_SECS))
            .unwrap_or_else(|| Utc::now() - Duration::seconds(1));

        debug!(path = %path.display(), expires_at = %expires_at, "Credentials loaded");

        Ok(Self {
            path,
            token_url: token_url.to_string(),
            http,
            state: Mutex::new(TokenState {
                consumer_key: file.consumer_key,
                consumer_secret: Secret::new(file.consumer_secret),
                access_token: file.access_token.filter(|t| !t.is_empty()).map(Secret::new),
                refresh_token: Secret::new(refresh_token),
                expires_at,
                token_type: file.token_type,
                guid: file.guid,
            }),
        })
    }

    /// A bearer token valid for at least the refresh margin.
    pub async fn bearer(&self) -> Result<SecretString, FetchError> {
        let mut state = self.state.lock().await;
        if state.needs_refresh(Utc::now()) {
            self.refresh(&mut state).await?;
        }
        state
            .access_token
            .clone()
            .ok_or_else(|| FetchError::Auth("no access token after refresh".into()))
    }

    /// Force a refresh on the next [`bearer`](Self::bearer) call, e.g. after a 401.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.access_token = None;
    }

    async fn refresh(&self, state: &mut TokenState) -> Result<(), FetchError> {
        info!("Refreshing Yahoo access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("redirect_uri", "oob"),
            ("refresh_token", state.refresh_token.expose_secret().as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&state.consumer_key, Some(state.consumer_secret.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("token refresh request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Auth(format!("token refresh rejected ({status}): {body}")));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("token refresh failed with {status}")));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Malformed(format!("token refresh response: {e}")))?;

        let issued = Utc::now();
        state.access_token = Some(Secret::new(body.access_token));
        if let Some(rt) = body.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = Secret::new(rt);
        }
        state.expires_at =
            issued + Duration::seconds(body.expires_in.unwrap_or(TOKEN_LIFETIME_SECS));
        if body.token_type.is_some() {
            state.token_type = body.token_type;
        }
        if body.xoauth_yahoo_guid.is_some() {
            state.guid = body.xoauth_yahoo_guid;
        }

        if let Err(e) = self.save(state, issued) {
            warn!(error = %e, path = %self.path.display(), "Failed to persist refreshed token");
        }
        debug!(expires_at = %state.expires_at, "Access token refreshed");
        Ok(())
    }

    fn save(&self, state: &TokenState, issued: DateTime<Utc>) -> anyhow::Result<()> {
        let file = CredentialFile {
            consumer_key: state.consumer_key.clone(),
            consumer_secret: state.consumer_secret.expose_secret().clone(),
            access_token: state.access_token.as_ref().map(|t| t.expose_secret().clone()),
            refresh_token: Some(state.refresh_token.expose_secret().clone()),
            token_time: Some(issued.timestamp() as f64),
            token_type: state.token_type.clone(),
            guid: state.guid.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
