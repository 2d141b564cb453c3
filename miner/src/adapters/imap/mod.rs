//! IMAP session handling: configuration, handshake, pooling

pub mod config;
pub mod connection;
pub mod pool;
pub mod provider;
pub mod session;

pub use config::{SessionAuth, SessionConfig, SessionConfigBuilder};
pub use connection::ImapSessionFactory;
pub use pool::{ManageSession, PooledSession, SessionPool};
pub use provider::ImapConnectionProvider;
pub use session::{MailSession, MailboxStatus, RawMessage, SessionFactory};
