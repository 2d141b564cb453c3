use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::fetcher::EmailFetcher;
use crate::adapters::broker::Broker;
use crate::adapters::imap::{ImapConnectionProvider, SessionFactory};
use crate::config::{ImapSettings, OAuthSettings};
use crate::credentials::{CredentialStore, MiningSource};
use crate::oauth::{HttpTokenRefresher, OAuthProvider};
use crate::types::error::{MinerError, Result};
use crate::types::records::{FetchStartRequest, FetchStartResponse, FetchStopRequest};

/// Control surface of the fetch engine, in-process or remote.
#[async_trait]
pub trait FetchService: Send + Sync {
    async fn start(&self, request: FetchStartRequest) -> Result<FetchStartResponse>;

    /// Stop a job. Unknown mining ids are ignored.
    async fn stop(&self, request: FetchStopRequest) -> Result<()>;
}

/// Runs fetch jobs in this process, one [`EmailFetcher`] per mining id.
pub struct LocalFetchService {
    fetchers: Mutex<HashMap<String, EmailFetcher>>,
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn SessionFactory>,
    broker: Arc<dyn Broker>,
    settings: ImapSettings,
    oauth: OAuthSettings,
}

impl LocalFetchService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn SessionFactory>,
        broker: Arc<dyn Broker>,
        settings: ImapSettings,
        oauth: OAuthSettings,
    ) -> Self {
        Self {
            fetchers: Mutex::new(HashMap::new()),
            credentials,
            factory,
            broker,
            settings,
            oauth,
        }
    }

    pub async fn running(&self) -> usize {
        self.fetchers.lock().await.len()
    }

    fn build_provider(&self, email: &str, source: MiningSource) -> Result<ImapConnectionProvider> {
        let mut provider = ImapConnectionProvider::new(
            email,
            self.factory.clone(),
            self.settings.max_connections,
            self.settings.connect_timeout(),
            self.settings.greeting_timeout(),
        );

        match source {
            MiningSource::Password {
                host,
                port,
                tls,
                password,
            } => {
                provider.configure_with_password(&host, &password, tls, port)?;
            }
            MiningSource::OAuth {
                provider: kind,
                host,
                access_token,
                refresh_token,
                ..
            } => {
                match &host {
                    Some(host) => provider.configure_with_oauth_host(host, 993, &access_token)?,
                    None => provider.configure_with_oauth(&access_token)?,
                };

                let kind = kind.or_else(|| OAuthProvider::from_email(email));
                match (kind, refresh_token) {
                    (Some(kind), Some(refresh_token)) => match self.oauth.provider_config(kind) {
                        Some(config) => {
                            let refresher = HttpTokenRefresher::new(kind, config, refresh_token)?;
                            provider.set_token_refresher(Arc::new(refresher));
                        }
                        None => {
                            warn!(email, provider = ?kind, "No OAuth client configured, token refresh disabled");
                        }
                    },
                    _ => debug!(email, "OAuth source without refresh support"),
                }
            }
        }

        Ok(provider)
    }
}

fn validate(request: &FetchStartRequest) -> Result<()> {
    if request.mining_id.trim().is_empty() {
        return Err(MinerError::InvalidInput("miningId is required".into()));
    }
    if request.user_id.trim().is_empty() {
        return Err(MinerError::InvalidInput("userId is required".into()));
    }
    if request.boxes.is_empty() {
        return Err(MinerError::InvalidInput("at least one folder is required".into()));
    }
    if request.contact_stream.trim().is_empty() || request.signature_stream.trim().is_empty() {
        return Err(MinerError::InvalidInput("output streams are required".into()));
    }
    Ok(())
}

#[async_trait]
impl FetchService for LocalFetchService {
    async fn start(&self, request: FetchStartRequest) -> Result<FetchStartResponse> {
        validate(&request)?;
        let mining_id = request.mining_id.clone();

        let source = self
            .credentials
            .resolve(&request.user_id, &request.email)
            .await?;
        let provider = self.build_provider(&request.email, source)?;

        let fetcher = {
            let mut fetchers = self.fetchers.lock().await;
            if fetchers.contains_key(&mining_id) {
                return Err(MinerError::InvalidInput(format!(
                    "fetch already running for {}",
                    mining_id
                )));
            }
            let fetcher = EmailFetcher::new(
                request,
                Arc::new(provider),
                self.broker.clone(),
                self.settings.clone(),
            );
            fetchers.insert(mining_id.clone(), fetcher.clone());
            fetcher
        };

        match fetcher.start().await {
            Ok(total_messages) => {
                info!(mining_id = %mining_id, total_messages, "Fetch started");
                Ok(FetchStartResponse { total_messages })
            }
            Err(e) => {
                warn!(mining_id = %mining_id, error = %e, "Fetch failed to start");
                self.fetchers.lock().await.remove(&mining_id);
                fetcher.discard().await;
                Err(e)
            }
        }
    }

    async fn stop(&self, request: FetchStopRequest) -> Result<()> {
        let fetcher = self.fetchers.lock().await.remove(&request.mining_id);
        match fetcher {
            Some(fetcher) => {
                fetcher.stop(request.canceled).await;
                info!(mining_id = %request.mining_id, canceled = request.canceled, "Fetch stopped by request");
            }
            None => debug!(mining_id = %request.mining_id, "Stop for unknown fetch ignored"),
        }
        Ok(())
    }
}
