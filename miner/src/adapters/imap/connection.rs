use std::fmt;
use std::time::Instant;

use async_imap::Session;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use futures::TryFutureExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use super::config::{SessionAuth, SessionConfig};
use super::session::{MailSession, MailboxStatus, RawMessage, SessionFactory};
use crate::oauth::build_xoauth2_string;
use crate::services::logger::fmt_ms;
use crate::types::error::{MinerError, NetworkErrorKind, Result};

const FETCH_FULL: &str = "(UID BODY.PEEK[])";
const FETCH_HEADER: &str = "(UID BODY.PEEK[HEADER])";

/// Opens real IMAP sessions: TCP, optional TLS, then LOGIN or XOAUTH2.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImapSessionFactory;

#[async_trait]
impl SessionFactory for ImapSessionFactory {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>> {
        info!(host = %config.host, port = config.port, user = %config.user, oauth = config.is_oauth(), "Connecting to IMAP server");
        let started = Instant::now();

        let tcp = timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            MinerError::network(
                NetworkErrorKind::Timeout,
                format!("TCP connection to {}:{} timed out", config.host, config.port),
            )
        })?
        .map_err(|e| MinerError::from_io(&e))?;

        let session: Box<dyn MailSession> = if config.tls {
            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = tls
                .connect(config.host.as_str(), tcp.compat())
                .await
                .map_err(|e| {
                    MinerError::network(
                        NetworkErrorKind::Other,
                        format!("TLS handshake failed: {}", e),
                    )
                })?;
            Box::new(ImapSession::new(handshake(tls_stream, config).await?, config))
        } else {
            Box::new(ImapSession::new(handshake(tcp.compat(), config).await?, config))
        };

        debug!(host = %config.host, elapsed = %fmt_ms(started.elapsed()), "IMAP session ready");
        Ok(session)
    }
}

/// Read the greeting and authenticate, bounded by the greeting timeout.
async fn handshake<T>(stream: T, config: &SessionConfig) -> Result<Session<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    let oauth = config.is_oauth();
    let attempt = async {
        let mut client = async_imap::Client::new(stream);

        // authenticate() expects the "+" continuation, not the greeting
        let greeting = client.read_response().await.transpose().map_err(|e| {
            MinerError::Protocol(format!("Failed to read server greeting: {}", e))
        })?;
        if greeting.is_none() {
            return Err(MinerError::network(
                NetworkErrorKind::ConnectionLost,
                "server closed the connection before greeting",
            ));
        }

        match &config.auth {
            SessionAuth::Password(password) => client
                .login(&config.user, password)
                .await
                .map_err(|(e, _)| login_failure(e, false)),
            SessionAuth::OAuth { access_token } => client
                .authenticate("XOAUTH2", XOAuth2::new(&config.user, access_token))
                .await
                .map_err(|(e, _)| login_failure(e, true)),
        }
    };

    timeout(config.greeting_timeout, attempt)
        .await
        .map_err(|_| {
            MinerError::network(
                NetworkErrorKind::Timeout,
                format!("IMAP greeting from {} timed out", config.host),
            )
        })?
}

// A tagged NO/BAD in reply to LOGIN or AUTHENTICATE is always a credential problem.
fn login_failure(err: async_imap::error::Error, oauth: bool) -> MinerError {
    use async_imap::error::Error as ImapError;

    match err {
        ImapError::No(message) | ImapError::Bad(message) => MinerError::auth(message, oauth),
        other => MinerError::from_imap(other, oauth),
    }
}

struct XOAuth2 {
    response: Vec<u8>,
    sent: bool,
}

impl XOAuth2 {
    fn new(user: &str, access_token: &str) -> Self {
        Self {
            response: build_xoauth2_string(user, access_token).into_bytes(),
            sent: false,
        }
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        if self.sent {
            // Error challenge: an empty reply lets the server finish with NO
            Vec::new()
        } else {
            self.sent = true;
            self.response.clone()
        }
    }
}

/// A live IMAP session over any async stream.
pub struct ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    session: Session<T>,
    host: String,
    oauth: bool,
}

impl<T> ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    fn new(session: Session<T>, config: &SessionConfig) -> Self {
        Self {
            session,
            host: config.host.clone(),
            oauth: config.is_oauth(),
        }
    }
}

#[async_trait]
impl<T> MailSession for ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send + 'static,
{
    async fn examine(&mut self, folder: &str) -> Result<MailboxStatus> {
        let mailbox = self
            .session
            .examine(folder)
            .await
            .map_err(|e| MinerError::from_imap(e, self.oauth))?;
        Ok(MailboxStatus {
            exists: mailbox.exists,
        })
    }

    fn fetch_range<'a>(
        &'a mut self,
        range: &str,
        with_body: bool,
    ) -> BoxStream<'a, Result<RawMessage>> {
        let oauth = self.oauth;
        let range = range.to_string();
        let query = if with_body { FETCH_FULL } else { FETCH_HEADER };
        let session = &mut self.session;

        async move { session.fetch(range, query).await }
            .map_err(move |e| MinerError::from_imap(e, oauth))
            .map_ok(move |fetches| {
                fetches.map(move |item| -> Result<Option<RawMessage>> {
                    let fetch = item.map_err(|e| MinerError::from_imap(e, oauth))?;
                    let content = if with_body {
                        fetch.body()
                    } else {
                        fetch.header()
                    };
                    Ok(content.map(|raw| RawMessage {
                        seq: fetch.message,
                        raw: raw.to_vec(),
                        includes_body: with_body,
                    }))
                })
            })
            .try_flatten_stream()
            .try_filter_map(|message| async move {
                if message.is_none() {
                    warn!("Skipping FETCH response without message content");
                }
                Ok::<_, MinerError>(message)
            })
            .boxed()
    }

    async fn close_mailbox(&mut self) -> Result<()> {
        self.session
            .close()
            .await
            .map_err(|e| MinerError::from_imap(e, self.oauth))
    }

    async fn logout(&mut self) -> Result<()> {
        debug!(host = %self.host, "Logging out of IMAP session");
        self.session
            .logout()
            .await
            .map_err(|e| MinerError::from_imap(e, self.oauth))
    }
}
