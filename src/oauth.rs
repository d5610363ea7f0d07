//! OAuth token refresh against the Bungie authorization server.

use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::model::Credential;

/// Token endpoint of the Bungie OAuth application flow.
pub const TOKEN_URL: &str = "https://www.bungie.net/Platform/App/OAuth/token/";

/// A token this close to expiry is refreshed anyway, so it cannot expire
/// between the check and the API call that uses it.
const EXPIRY_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("authorization server rejected refresh ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("token response decode failure: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    // Bungie rotates refresh tokens, but the field is optional in the
    // OAuth spec; keep the old one if the server omits it.
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Exchanges refresh tokens for fresh access tokens.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TokenRefresher {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::with_token_url(client_id, client_secret, TOKEN_URL)
    }

    pub fn with_token_url(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("guardian-sync/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Perform the refresh-token grant and build the replacement credential.
    async fn refresh(&self, cred: &Credential) -> Result<Credential, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", &cred.refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        let response = self.http.post(&self.token_url).form(&params).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RefreshError::Rejected { status, body });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        debug!(expires_in = token.expires_in, "access token refreshed");
        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| cred.refresh_token.clone()),
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}

/// Hands out credentials guaranteed fresh enough for an API call.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a usable credential, refreshing the given one if needed. The
    /// boolean reports whether a refresh happened, so the caller knows to
    /// persist the replacement tokens.
    async fn ensure_fresh(&self, cred: &Credential) -> Result<(Credential, bool), RefreshError>;
}

#[async_trait::async_trait]
impl TokenSource for TokenRefresher {
    async fn ensure_fresh(&self, cred: &Credential) -> Result<(Credential, bool), RefreshError> {
        if !needs_refresh(cred, Utc::now()) {
            return Ok((cred.clone(), false));
        }
        let refreshed = self.refresh(cred).await?;
        Ok((refreshed, true))
    }
}

pub(crate) fn needs_refresh(cred: &Credential, now: chrono::DateTime<Utc>) -> bool {
    cred.expires_at - chrono::Duration::seconds(EXPIRY_LEEWAY_SECS) <= now
}
