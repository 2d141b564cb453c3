//! Resolved mailbox credentials
//!
//! Secrets are owned by an external store; the miner only reads them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::oauth::OAuthProvider;
use crate::types::error::{MinerError, Result};

/// How to reach and authenticate against one mailbox
#[derive(Clone, PartialEq, Eq)]
pub enum MiningSource {
    Password {
        host: String,
        port: u16,
        tls: bool,
        password: String,
    },
    OAuth {
        provider: Option<OAuthProvider>,
        /// Explicit endpoint for providers without a known one
        host: Option<String>,
        access_token: String,
        refresh_token: Option<String>,
        /// Unix timestamp
        expires_at: Option<i64>,
    },
}

impl MiningSource {
    pub fn is_oauth(&self) -> bool {
        matches!(self, MiningSource::OAuth { .. })
    }
}

impl fmt::Debug for MiningSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningSource::Password { host, port, tls, .. } => f
                .debug_struct("Password")
                .field("host", host)
                .field("port", port)
                .field("tls", tls)
                .finish_non_exhaustive(),
            MiningSource::OAuth {
                provider,
                host,
                expires_at,
                ..
            } => f
                .debug_struct("OAuth")
                .field("provider", provider)
                .field("host", host)
                .field("expires_at", expires_at)
                .finish_non_exhaustive(),
        }
    }
}

/// Looks up credentials for a user's mailbox.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, user_id: &str, email: &str) -> Result<MiningSource>;
}

/// In-memory store keyed by `(user_id, email)`.
#[derive(Default)]
pub struct StaticCredentialStore {
    sources: RwLock<HashMap<(String, String), MiningSource>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, email: &str, source: MiningSource) {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user_id.to_string(), email.to_lowercase()), source);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn resolve(&self, user_id: &str, email: &str) -> Result<MiningSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user_id.to_string(), email.to_lowercase()))
            .cloned()
            .ok_or_else(|| MinerError::NotFound(format!("no credentials for {}", email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_store_lookup() {
        let store = StaticCredentialStore::new();
        store.insert(
            "u1",
            "Me@Example.com",
            MiningSource::Password {
                host: "imap.example.com".into(),
                port: 993,
                tls: true,
                password: "secret".into(),
            },
        );

        let source = store.resolve("u1", "me@example.com").await.unwrap();
        assert!(!source.is_oauth());
        assert!(!format!("{:?}", source).contains("secret"));

        match store.resolve("u2", "me@example.com").await {
            Err(MinerError::NotFound(_)) => {}
            _ => panic!("Wrong result for unknown user"),
        }
    }
}
