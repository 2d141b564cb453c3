use async_trait::async_trait;
use futures::stream::BoxStream;

use super::config::SessionConfig;
use crate::types::error::Result;

/// Message count of a mailbox opened read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
}

/// One FETCH response: the sequence number and the raw RFC 822 bytes
/// (headers only unless the body was requested).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub seq: u32,
    pub raw: Vec<u8>,
    pub includes_body: bool,
}

/// An authenticated mail session. Owned by one worker at a time.
#[async_trait]
pub trait MailSession: Send {
    /// Open a folder read-only.
    async fn examine(&mut self, folder: &str) -> Result<MailboxStatus>;

    /// Stream the messages of `range` (an IMAP sequence set) in the
    /// order the server returns them.
    fn fetch_range<'a>(
        &'a mut self,
        range: &str,
        with_body: bool,
    ) -> BoxStream<'a, Result<RawMessage>>;

    async fn close_mailbox(&mut self) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}

/// Opens and authenticates sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>>;
}
