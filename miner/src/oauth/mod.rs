//! OAuth2 token handling for mailbox providers
//!
//! Covers what mining needs from OAuth:
//! - Resolving the IMAP endpoint of a provider from the mailbox domain
//! - Refreshing an expired access token with a stored refresh token
//!
//! The interactive consent flow lives outside this crate; tokens arrive
//! already issued through the credential store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::error::MinerError;

/// Errors that can occur during OAuth operations
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth configuration error: {0}")]
    Configuration(String),

    #[error("OAuth request failed: {0}")]
    Request(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<OAuthError> for MinerError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::Configuration(message) => MinerError::config(message, &["accessToken"]),
            other => MinerError::auth(other.to_string(), true),
        }
    }
}

/// Mailbox providers with built-in OAuth support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Microsoft,
}

impl OAuthProvider {
    /// Guess the provider from the domain of a mailbox address.
    pub fn from_email(email: &str) -> Option<Self> {
        let domain = email.rsplit_once('@')?.1.to_lowercase();
        match domain.as_str() {
            "gmail.com" | "googlemail.com" => Some(OAuthProvider::Google),
            "outlook.com" | "hotmail.com" | "live.com" | "msn.com" => {
                Some(OAuthProvider::Microsoft)
            }
            _ => None,
        }
    }

    pub fn imap_endpoint(&self) -> (&'static str, u16) {
        match self {
            OAuthProvider::Google => ("imap.gmail.com", 993),
            OAuthProvider::Microsoft => ("outlook.office365.com", 993),
        }
    }

    pub fn default_token_url(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "https://oauth2.googleapis.com/token",
            OAuthProvider::Microsoft => {
                "https://login.microsoftonline.com/common/oauth2/v2.0/token"
            }
        }
    }
}

/// OAuth2 tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp
    pub expires_at: Option<i64>,
}

/// Client registration used for refresh grants
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
}

/// Build the XOAUTH2 SASL initial response (before base64).
pub fn build_xoauth2_string(email: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", email, access_token)
}

/// Source of fresh access tokens for a running fetch job
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<OAuthTokens, OAuthError>;
}

/// Refreshes tokens against the provider's token endpoint.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    provider: OAuthProvider,
    config: ProviderConfig,
    refresh_token: Mutex<String>,
}

impl HttpTokenRefresher {
    pub fn new(
        provider: OAuthProvider,
        config: ProviderConfig,
        refresh_token: String,
    ) -> Result<Self, OAuthError> {
        if config.client_id.is_empty() {
            return Err(OAuthError::Configuration(format!(
                "no client id configured for {:?}",
                provider
            )));
        }
        if refresh_token.is_empty() {
            return Err(OAuthError::Configuration("refresh token is empty".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            config,
            refresh_token: Mutex::new(refresh_token),
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<OAuthTokens, OAuthError> {
        let mut refresh_token = self.refresh_token.lock().await;

        info!("Refreshing OAuth tokens for provider {:?}", self.provider);

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!("Refreshing access token");

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Token refresh failed: {}", error_text);
            return Err(OAuthError::RefreshFailed(error_text));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?;

        let tokens = token_response.into_tokens(&refresh_token);
        if let Some(rotated) = &tokens.refresh_token {
            *refresh_token = rotated.clone();
        }
        Ok(tokens)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    // Some providers don't return a new refresh token
    fn into_tokens(self, previous_refresh_token: &str) -> OAuthTokens {
        let expires_at = self
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs as i64);
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: Some(
                self.refresh_token
                    .unwrap_or_else(|| previous_refresh_token.to_string()),
            ),
            expires_at,
        }
    }
}
