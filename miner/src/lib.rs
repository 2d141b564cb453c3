//! mailminer - mailbox contact mining pipeline
//!
//! Pulls messages out of IMAP mailboxes and feeds them to the downstream
//! extraction and cleaning stages through a pub/sub broker.
//!
//! ## Module Organization
//!
//! - `adapters/`: IMAP sessions and pooling, broker, SQLite, HTTP clients
//! - `services/`: fetch engine, task orchestrator, logging
//! - `types/`: errors, task model and wire records
//! - `config/`: TOML configuration
//! - `credentials/`: resolved mailbox credentials
//! - `oauth/`: provider endpoints and token refresh

pub mod adapters;
pub mod config;
pub mod credentials;
pub mod oauth;
pub mod services;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::MinerConfig;
pub use types::error::{MinerError, Result};
