use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::config::{SessionAuth, SessionConfig, SessionConfigBuilder};
use super::pool::{ManageSession, PooledSession, SessionPool};
use super::session::{MailSession, SessionFactory};
use crate::oauth::TokenRefresher;
use crate::types::error::{MinerError, Result};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConfig = Arc<RwLock<Option<Arc<SessionConfig>>>>;

/// Pooled access to one mailbox.
///
/// Configure with one of the `configure_*` calls, then share behind an
/// `Arc`. The first [`acquire_connection`](Self::acquire_connection)
/// validates the credentials with a check session before the pool exists.
pub struct ImapConnectionProvider {
    email: String,
    builder: SessionConfigBuilder,
    config: SharedConfig,
    factory: Arc<dyn SessionFactory>,
    max_connections: usize,
    refresher: Option<Arc<dyn TokenRefresher>>,
    pool: OnceCell<SessionPool<ProviderManager>>,
}

struct ProviderManager {
    config: SharedConfig,
    factory: Arc<dyn SessionFactory>,
}

#[async_trait]
impl ManageSession for ProviderManager {
    async fn create(&self) -> Result<Box<dyn MailSession>> {
        let config = read_config(&self.config)
            .ok_or_else(|| MinerError::config("connection is not configured", &["host"]))?;
        self.factory.connect(&config).await
    }

    async fn dispose(&self, mut session: Box<dyn MailSession>) {
        match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Logout failed while disposing session"),
            Err(_) => debug!("Logout timed out while disposing session"),
        }
    }
}

fn read_config(config: &SharedConfig) -> Option<Arc<SessionConfig>> {
    config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

impl ImapConnectionProvider {
    pub fn new(
        email: &str,
        factory: Arc<dyn SessionFactory>,
        max_connections: usize,
        connect_timeout: Duration,
        greeting_timeout: Duration,
    ) -> Self {
        Self {
            email: email.trim().to_string(),
            builder: SessionConfigBuilder::new(email, connect_timeout, greeting_timeout),
            config: Arc::new(RwLock::new(None)),
            factory,
            max_connections: max_connections.max(1),
            refresher: None,
            pool: OnceCell::new(),
        }
    }

    pub fn configure_with_password(
        &mut self,
        host: &str,
        password: &str,
        tls: bool,
        port: u16,
    ) -> Result<&mut Self> {
        self.builder.with_password(host, password, tls, port)?;
        Ok(self)
    }

    pub fn configure_with_oauth(&mut self, access_token: &str) -> Result<&mut Self> {
        self.builder.with_oauth(access_token)?;
        Ok(self)
    }

    pub fn configure_with_oauth_host(
        &mut self,
        host: &str,
        port: u16,
        access_token: &str,
    ) -> Result<&mut Self> {
        self.builder.with_oauth_host(host, port, access_token)?;
        Ok(self)
    }

    pub fn set_token_refresher(&mut self, refresher: Arc<dyn TokenRefresher>) -> &mut Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Whether the frozen (or pending) configuration authenticates with OAuth.
    pub fn is_oauth(&self) -> bool {
        match read_config(&self.config) {
            Some(config) => config.is_oauth(),
            None => self.builder.build().map(|c| c.is_oauth()).unwrap_or(false),
        }
    }

    fn frozen_config(&self) -> Result<Arc<SessionConfig>> {
        if let Some(config) = read_config(&self.config) {
            return Ok(config);
        }
        let built = Arc::new(self.builder.build()?);
        let mut slot = self.config.write().unwrap_or_else(PoisonError::into_inner);
        Ok(slot.get_or_insert(built).clone())
    }

    /// Open one session outside the pool. Authentication and network
    /// failures come back classified.
    pub async fn connect(&self) -> Result<Box<dyn MailSession>> {
        let config = self.frozen_config()?;
        self.factory.connect(&config).await
    }

    pub async fn acquire_connection(&self) -> Result<PooledSession> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let mut check = self.connect().await?;
                if let Err(e) = check.logout().await {
                    debug!(error = %e, "Check session logout failed");
                }
                info!(email = %self.email, max_connections = self.max_connections, "Creating IMAP session pool");
                Ok::<_, MinerError>(SessionPool::new(
                    ProviderManager {
                        config: self.config.clone(),
                        factory: self.factory.clone(),
                    },
                    self.max_connections,
                ))
            })
            .await?;
        pool.acquire().await
    }

    /// Return a session to the pool. Never fails.
    pub async fn release_connection(&self, session: PooledSession) {
        match self.pool.get() {
            Some(pool) => pool.release(session).await,
            None => warn!("Released a session with no pool, dropping it"),
        }
    }

    /// Discard a session that must not be reused.
    pub async fn destroy_connection(&self, session: PooledSession) {
        match self.pool.get() {
            Some(pool) => pool.destroy(session).await,
            None => drop(session),
        }
    }

    /// Dispose every pooled session. A no-op before the pool exists.
    pub async fn clean_pool(&self) {
        if let Some(pool) = self.pool.get() {
            pool.drain().await;
            debug!(email = %self.email, "Session pool drained");
        }
    }

    pub fn in_use(&self) -> usize {
        self.pool.get().map(|pool| pool.in_use()).unwrap_or(0)
    }

    /// Fetch a new access token and drain the pool so no session opened
    /// with the stale token is reused.
    pub async fn refresh_oauth_token(&self) -> Result<()> {
        let config = self.frozen_config()?;
        if !matches!(config.auth, SessionAuth::OAuth { .. }) {
            return Err(MinerError::auth(
                "password sessions cannot refresh credentials",
                false,
            ));
        }
        let refresher = self
            .refresher
            .as_ref()
            .ok_or_else(|| MinerError::auth("no refresh token available", true))?;

        let tokens = refresher.refresh().await?;
        {
            let mut slot = self.config.write().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(Arc::new(config.with_access_token(tokens.access_token)));
        }
        info!(email = %self.email, "OAuth access token refreshed");

        self.clean_pool().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingRefresher, FakeServer};

    fn provider(server: &Arc<FakeServer>, max: usize) -> ImapConnectionProvider {
        ImapConnectionProvider::new(
            "me@example.com",
            server.clone(),
            max,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_fast() {
        let server = FakeServer::new(&[("INBOX", 3)]);
        let p = provider(&server, 2);
        match p.acquire_connection().await {
            Err(MinerError::Config { .. }) => {}
            _ => panic!("Wrong result for unconfigured provider"),
        }
        assert_eq!(server.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_bad_credentials_never_create_pool() {
        let server = FakeServer::new(&[("INBOX", 3)]);
        server.set_accepted_password("right");
        let mut p = provider(&server, 2);
        p.configure_with_password("imap.example.com", "wrong", true, 993)
            .unwrap();

        let err = p.acquire_connection().await.err().unwrap();
        assert!(err.is_auth());
        assert_eq!(err.fields(), vec!["email", "password"]);
        assert_eq!(p.in_use(), 0);

        // Pool still absent: cleaning is a no-op
        p.clean_pool().await;
        assert_eq!(server.stats().live, 0);
    }

    #[tokio::test]
    async fn test_check_then_pooled_sessions() {
        let server = FakeServer::new(&[("INBOX", 3)]);
        let mut p = provider(&server, 2);
        p.configure_with_password("imap.example.com", "secret", true, 993)
            .unwrap();

        let session = p.acquire_connection().await.unwrap();
        // check + first pooled session
        assert_eq!(server.stats().connects, 2);
        assert_eq!(p.in_use(), 1);
        p.release_connection(session).await;
        assert_eq!(p.in_use(), 0);

        let session = p.acquire_connection().await.unwrap();
        assert_eq!(server.stats().connects, 2);
        p.destroy_connection(session).await;
        p.clean_pool().await;
        p.clean_pool().await;
        assert_eq!(server.stats().live, 0);
    }

    #[tokio::test]
    async fn test_refresh_swaps_token_and_drains() {
        let server = FakeServer::new(&[("INBOX", 3)]);
        server.set_accepted_token("fresh");
        let refresher = CountingRefresher::succeeding("fresh");
        let mut p = ImapConnectionProvider::new(
            "me@gmail.com",
            server.clone(),
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        p.configure_with_oauth("stale").unwrap();
        p.set_token_refresher(refresher.clone());
        assert!(p.is_oauth());

        let err = p.connect().await.err().unwrap();
        assert!(err.is_auth());
        assert_eq!(err.fields(), vec!["accessToken"]);

        p.refresh_oauth_token().await.unwrap();
        assert_eq!(refresher.calls(), 1);
        let session = p.acquire_connection().await.unwrap();
        p.release_connection(session).await;
    }

    #[tokio::test]
    async fn test_password_provider_cannot_refresh() {
        let server = FakeServer::new(&[("INBOX", 3)]);
        let mut p = provider(&server, 2);
        p.configure_with_password("imap.example.com", "secret", true, 993)
            .unwrap();
        assert!(p.refresh_oauth_token().await.is_err());
    }
}
