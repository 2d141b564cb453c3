//! Unified error types for mining operations
//!
//! This module defines error types that:
//! - Are serializable for control-plane consumption
//! - Map to a stable HTTP status and the credential fields a caller must fix
//! - Classify protocol failures for the fetch engine's retry policy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which kind of network failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionRefused,
    HostNotFound,
    ConnectionLost,
    Other,
}

/// Application error type for the provider, fetch engine and orchestrator
///
/// `Config`, `Auth`, `Network` and `Protocol` form the connection taxonomy;
/// the rest are plumbing failures.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MinerError {
    #[error("Configuration error: {message}")]
    Config { message: String, fields: Vec<String> },

    #[error("Authentication error: {message}")]
    Auth { message: String, oauth: bool },

    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl MinerError {
    pub fn config(message: impl Into<String>, fields: &[&str]) -> Self {
        MinerError::Config {
            message: message.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn auth(message: impl Into<String>, oauth: bool) -> Self {
        MinerError::Auth {
            message: message.into(),
            oauth,
        }
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        MinerError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Classify a socket-level failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let text = err.to_string();
        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => NetworkErrorKind::ConnectionLost,
            _ if is_lookup_failure(&text) => NetworkErrorKind::HostNotFound,
            _ => NetworkErrorKind::Other,
        };
        MinerError::network(kind, text)
    }

    /// Classify an IMAP client failure. `oauth` records which credential
    /// shape was in use so the caller knows which field to highlight.
    pub fn from_imap(err: async_imap::error::Error, oauth: bool) -> Self {
        use async_imap::error::Error as ImapError;

        match err {
            ImapError::Io(e) => MinerError::from_io(&e),
            ImapError::ConnectionLost => {
                MinerError::network(NetworkErrorKind::ConnectionLost, "connection lost")
            }
            ImapError::No(message) if is_auth_failure(&message) => MinerError::auth(message, oauth),
            ImapError::No(message) => MinerError::Protocol(message),
            ImapError::Bad(message) if is_auth_failure(&message) => {
                MinerError::auth(message, oauth)
            }
            ImapError::Bad(message) => MinerError::Protocol(message),
            other => MinerError::Protocol(other.to_string()),
        }
    }

    /// Stable HTTP status for the control plane.
    pub fn status_code(&self) -> u16 {
        match self {
            MinerError::Config { .. } | MinerError::InvalidInput(_) => 400,
            MinerError::Auth { .. } => 401,
            MinerError::NotFound(_) => 404,
            MinerError::Network { kind, .. } => match kind {
                NetworkErrorKind::Timeout => 504,
                NetworkErrorKind::HostNotFound => 502,
                NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::ConnectionLost
                | NetworkErrorKind::Other => 503,
            },
            MinerError::Protocol(_) => 502,
            MinerError::Broker(_)
            | MinerError::Database(_)
            | MinerError::Io(_)
            | MinerError::Parse(_)
            | MinerError::Other(_) => 500,
        }
    }

    /// Credential fields implicated by this error.
    pub fn fields(&self) -> Vec<String> {
        let names: &[&str] = match self {
            MinerError::Config { fields, .. } => return fields.clone(),
            MinerError::Auth { oauth: true, .. } => &["accessToken"],
            MinerError::Auth { oauth: false, .. } => &["email", "password"],
            MinerError::Network { kind, .. } => match kind {
                NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionRefused => {
                    &["host", "port"]
                }
                NetworkErrorKind::HostNotFound => &["host"],
                _ => &[],
            },
            _ => &[],
        };
        names.iter().map(|f| f.to_string()).collect()
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, MinerError::Auth { .. })
    }

    /// Failures worth retrying against the error budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, MinerError::Network { .. } | MinerError::Protocol(_))
    }

    /// Whether the session that produced this error must be discarded
    /// instead of returned to the pool.
    pub fn destroys_session(&self) -> bool {
        matches!(
            self,
            MinerError::Auth { .. } | MinerError::Network { .. } | MinerError::Protocol(_)
        )
    }
}

fn is_auth_failure(message: &str) -> bool {
    let upper = message.to_uppercase();
    upper.contains("AUTHENTICATIONFAILED")
        || upper.contains("AUTHENTICATE FAILED")
        || upper.contains("INVALID CREDENTIALS")
        || upper.contains("LOGIN FAILED")
        || upper.contains("EXPIRED")
}

fn is_lookup_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host")
}

/// Error body returned by the fetch service control API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl From<&MinerError> for ErrorResponse {
    fn from(err: &MinerError) -> Self {
        ErrorResponse {
            message: err.to_string(),
            fields: err.fields(),
        }
    }
}

impl ErrorResponse {
    /// Rebuild a classified error from a remote status and body.
    pub fn into_error(self, status: u16) -> MinerError {
        let oauth = self.fields.iter().any(|f| f == "accessToken");
        match status {
            400 if !self.fields.is_empty() => MinerError::Config {
                message: self.message,
                fields: self.fields,
            },
            400 => MinerError::InvalidInput(self.message),
            401 => MinerError::auth(self.message, oauth),
            404 => MinerError::NotFound(self.message),
            502 if self.fields.iter().any(|f| f == "host") => {
                MinerError::network(NetworkErrorKind::HostNotFound, self.message)
            }
            502 => MinerError::Protocol(self.message),
            503 => MinerError::network(NetworkErrorKind::ConnectionRefused, self.message),
            504 => MinerError::network(NetworkErrorKind::Timeout, self.message),
            _ => MinerError::Other(self.message),
        }
    }
}

// Implement From for common error types

impl From<std::io::Error> for MinerError {
    fn from(err: std::io::Error) -> Self {
        MinerError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for MinerError {
    fn from(err: toml::de::Error) -> Self {
        MinerError::config(err.to_string(), &[])
    }
}

impl From<serde_json::Error> for MinerError {
    fn from(err: serde_json::Error) -> Self {
        MinerError::Parse(err.to_string())
    }
}

impl From<r2d2::Error> for MinerError {
    fn from(err: r2d2::Error) -> Self {
        MinerError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for MinerError {
    fn from(err: rusqlite::Error) -> Self {
        MinerError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for MinerError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::Other
        };
        MinerError::network(kind, err.to_string())
    }
}

impl From<mailparse::MailParseError> for MinerError {
    fn from(err: mailparse::MailParseError) -> Self {
        MinerError::Parse(err.to_string())
    }
}

/// Result type alias using MinerError
pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_and_fields() {
        let err = MinerError::config("host is required", &["host"]);
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.fields(), vec!["host"]);

        let err = MinerError::auth("AUTHENTICATIONFAILED", false);
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.fields(), vec!["email", "password"]);

        let err = MinerError::auth("token expired", true);
        assert_eq!(err.fields(), vec!["accessToken"]);

        let err = MinerError::network(NetworkErrorKind::Timeout, "timed out");
        assert_eq!(err.status_code(), 504);
        assert_eq!(err.fields(), vec!["host", "port"]);

        let err = MinerError::network(NetworkErrorKind::HostNotFound, "no such host");
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.fields(), vec!["host"]);
    }

    #[test]
    fn test_io_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            MinerError::from_io(&refused),
            MinerError::Network {
                kind: NetworkErrorKind::ConnectionRefused,
                ..
            }
        ));

        let lookup = std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert!(matches!(
            MinerError::from_io(&lookup),
            MinerError::Network {
                kind: NetworkErrorKind::HostNotFound,
                ..
            }
        ));
    }

    #[test]
    fn test_imap_classification() {
        let err = MinerError::from_imap(
            async_imap::error::Error::No("[AUTHENTICATIONFAILED] Invalid credentials".into()),
            true,
        );
        assert!(err.is_auth());
        assert_eq!(err.fields(), vec!["accessToken"]);

        let err = MinerError::from_imap(async_imap::error::Error::ConnectionLost, false);
        assert!(err.is_transient());
        assert!(err.destroys_session());

        let err = MinerError::from_imap(
            async_imap::error::Error::Bad("mailbox does not exist".into()),
            false,
        );
        assert!(matches!(err, MinerError::Protocol(_)));
    }

    #[test]
    fn test_error_response_round_trip_keeps_classification() {
        let err = MinerError::auth("bad password", false);
        let body = ErrorResponse::from(&err);
        let json = serde_json::to_string(&body).unwrap();
        let decoded: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert!(decoded.into_error(err.status_code()).is_auth());
    }
}
