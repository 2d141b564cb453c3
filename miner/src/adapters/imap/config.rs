use std::fmt;
use std::time::Duration;

use crate::oauth::OAuthProvider;
use crate::types::error::{MinerError, Result};

/// How a session proves its identity
#[derive(Clone, PartialEq, Eq)]
pub enum SessionAuth {
    Password(String),
    OAuth { access_token: String },
}

/// Everything needed to open one IMAP session. Frozen once the provider
/// makes its first connection; only the access token is ever swapped after.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub auth: SessionAuth,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
}

impl SessionConfig {
    pub fn is_oauth(&self) -> bool {
        matches!(self.auth, SessionAuth::OAuth { .. })
    }

    pub fn with_access_token(&self, access_token: String) -> Self {
        Self {
            auth: SessionAuth::OAuth { access_token },
            ..self.clone()
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match self.auth {
            SessionAuth::Password(_) => "password",
            SessionAuth::OAuth { .. } => "oauth",
        };
        f.debug_struct("SessionConfig")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("auth", &auth)
            .field("connect_timeout", &self.connect_timeout)
            .field("greeting_timeout", &self.greeting_timeout)
            .finish()
    }
}

/// Pending configuration, filled by the `configure_*` calls of the provider.
#[derive(Clone)]
pub struct SessionConfigBuilder {
    user: String,
    host: Option<String>,
    port: u16,
    tls: bool,
    auth: Option<SessionAuth>,
    connect_timeout: Duration,
    greeting_timeout: Duration,
}

impl SessionConfigBuilder {
    pub fn new(user: &str, connect_timeout: Duration, greeting_timeout: Duration) -> Self {
        Self {
            user: user.trim().to_string(),
            host: None,
            port: 993,
            tls: true,
            auth: None,
            connect_timeout,
            greeting_timeout,
        }
    }

    pub fn with_password(
        &mut self,
        host: &str,
        password: &str,
        tls: bool,
        port: u16,
    ) -> Result<&mut Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(MinerError::config("IMAP host is required", &["host"]));
        }
        if password.is_empty() {
            return Err(MinerError::config("password is required", &["password"]));
        }
        if port == 0 {
            return Err(MinerError::config("IMAP port must be non-zero", &["port"]));
        }
        self.host = Some(host.to_string());
        self.port = port;
        self.tls = tls;
        self.auth = Some(SessionAuth::Password(password.to_string()));
        Ok(self)
    }

    /// OAuth with the endpoint inferred from the mailbox domain.
    pub fn with_oauth(&mut self, access_token: &str) -> Result<&mut Self> {
        let provider = OAuthProvider::from_email(&self.user).ok_or_else(|| {
            MinerError::config(
                format!("no known OAuth IMAP endpoint for {}", self.user),
                &["host"],
            )
        })?;
        let (host, port) = provider.imap_endpoint();
        self.with_oauth_host(host, port, access_token)
    }

    pub fn with_oauth_host(
        &mut self,
        host: &str,
        port: u16,
        access_token: &str,
    ) -> Result<&mut Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(MinerError::config("IMAP host is required", &["host"]));
        }
        if access_token.trim().is_empty() {
            return Err(MinerError::config(
                "access token is required",
                &["accessToken"],
            ));
        }
        if port == 0 {
            return Err(MinerError::config("IMAP port must be non-zero", &["port"]));
        }
        self.host = Some(host.to_string());
        self.port = port;
        self.tls = true;
        self.auth = Some(SessionAuth::OAuth {
            access_token: access_token.trim().to_string(),
        });
        Ok(self)
    }

    pub fn build(&self) -> Result<SessionConfig> {
        if self.user.is_empty() || !self.user.contains('@') {
            return Err(MinerError::config(
                "a mailbox address is required",
                &["email"],
            ));
        }
        let (host, auth) = match (&self.host, &self.auth) {
            (Some(host), Some(auth)) => (host.clone(), auth.clone()),
            _ => {
                return Err(MinerError::config(
                    "connection is not configured",
                    &["host", "password"],
                ))
            }
        };
        Ok(SessionConfig {
            user: self.user.clone(),
            host,
            port: self.port,
            tls: self.tls,
            auth,
            connect_timeout: self.connect_timeout,
            greeting_timeout: self.greeting_timeout,
        })
    }
}
