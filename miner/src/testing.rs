//! In-process fakes shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::adapters::broker::Broker;
use crate::adapters::imap::{
    MailSession, MailboxStatus, RawMessage, SessionAuth, SessionConfig, SessionFactory,
};
use crate::oauth::{OAuthError, OAuthTokens, TokenRefresher};
use crate::services::fetch::FetchService;
use crate::services::tasks::{ProgressSink, TaskStore};
use crate::types::error::{MinerError, NetworkErrorKind, Result};
use crate::types::mining::StageRecord;
use crate::types::records::{FetchStartRequest, FetchStartResponse, FetchStopRequest};

/// Counters kept by [`FakeServer`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub connects: usize,
    pub live: usize,
    pub max_live: usize,
    pub opens: usize,
    pub closes: usize,
    pub fetches: usize,
    pub logouts: usize,
}

/// One FETCH command seen by the server
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub folder: String,
    pub range: String,
    /// 1-based across the whole server
    pub index: usize,
}

type FetchFailure = Arc<dyn Fn(&FetchCall) -> Option<MinerError> + Send + Sync>;

#[derive(Default)]
struct FakeState {
    stats: FakeStats,
    accepted_password: Option<String>,
    accepted_token: Option<String>,
    expired_tokens: HashSet<String>,
    fetch_failure: Option<FetchFailure>,
    close_failures: usize,
    message_delay: Duration,
    sender: Option<String>,
    corrupted: HashSet<(String, u32)>,
}

/// Scriptable mail server. Message `i` of folder `f` has the id `<f-i@example.com>`.
pub struct FakeServer {
    folders: Arc<HashMap<String, u32>>,
    state: Arc<Mutex<FakeState>>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeServer {
    pub fn new(folders: &[(&str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            folders: Arc::new(
                folders
                    .iter()
                    .map(|(name, count)| (name.to_string(), *count))
                    .collect(),
            ),
            state: Arc::new(Mutex::new(FakeState::default())),
        })
    }

    pub fn stats(&self) -> FakeStats {
        lock(&self.state).stats.clone()
    }

    pub fn set_accepted_password(&self, password: &str) {
        lock(&self.state).accepted_password = Some(password.to_string());
    }

    pub fn set_accepted_token(&self, token: &str) {
        lock(&self.state).accepted_token = Some(token.to_string());
    }

    /// Sessions opened with `token` log in but every FETCH is refused.
    pub fn expire_token(&self, token: &str) {
        lock(&self.state).expired_tokens.insert(token.to_string());
    }

    pub fn fail_fetch_when(
        &self,
        failure: impl Fn(&FetchCall) -> Option<MinerError> + Send + Sync + 'static,
    ) {
        lock(&self.state).fetch_failure = Some(Arc::new(failure));
    }

    /// The next `n` CLOSE commands issued after a FETCH fail.
    pub fn fail_closes_after_fetch(&self, n: usize) {
        lock(&self.state).close_failures = n;
    }

    pub fn set_message_delay(&self, delay: Duration) {
        lock(&self.state).message_delay = delay;
    }

    /// Serve message `seq` of `folder` with headers no parser accepts.
    pub fn corrupt_message(&self, folder: &str, seq: u32) {
        lock(&self.state)
            .corrupted
            .insert((folder.to_string(), seq));
    }

    /// Use `address` as the From of every message.
    pub fn set_sender(&self, address: &str) {
        lock(&self.state).sender = Some(address.to_string());
    }

    /// A logged-in session, bypassing credential checks.
    pub fn open_session(&self) -> Result<Box<dyn MailSession>> {
        Ok(Box::new(self.session(None)))
    }

    fn session(&self, token: Option<String>) -> FakeSession {
        let mut state = lock(&self.state);
        state.stats.connects += 1;
        state.stats.live += 1;
        state.stats.max_live = state.stats.max_live.max(state.stats.live);
        FakeSession {
            folders: self.folders.clone(),
            state: self.state.clone(),
            token,
            selected: None,
            fetched_since_open: false,
            alive: true,
        }
    }
}

#[async_trait]
impl SessionFactory for FakeServer {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn MailSession>> {
        let token = {
            let state = lock(&self.state);
            match &config.auth {
                SessionAuth::Password(password) => {
                    if state
                        .accepted_password
                        .as_ref()
                        .is_some_and(|accepted| accepted != password)
                    {
                        return Err(MinerError::auth(
                            "[AUTHENTICATIONFAILED] Invalid credentials",
                            false,
                        ));
                    }
                    None
                }
                SessionAuth::OAuth { access_token } => {
                    let rejected = state
                        .accepted_token
                        .as_ref()
                        .is_some_and(|accepted| accepted != access_token)
                        && !state.expired_tokens.contains(access_token);
                    if rejected {
                        return Err(MinerError::auth(
                            "[AUTHENTICATIONFAILED] Invalid credentials",
                            true,
                        ));
                    }
                    Some(access_token.clone())
                }
            }
        };
        Ok(Box::new(self.session(token)))
    }
}

struct FakeSession {
    folders: Arc<HashMap<String, u32>>,
    state: Arc<Mutex<FakeState>>,
    token: Option<String>,
    selected: Option<String>,
    fetched_since_open: bool,
    alive: bool,
}

impl FakeSession {
    fn retire(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        self.alive = false;
        lock(&self.state).stats.live -= 1;
        true
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.retire();
    }
}

fn parse_range(range: &str, exists: u32) -> (u32, u32) {
    let (start, end) = range.split_once(':').unwrap_or((range, range));
    let start = start.parse().unwrap_or(1);
    let end = if end == "*" {
        exists
    } else {
        end.parse().unwrap_or(exists).min(exists)
    };
    (start, end)
}

fn fake_message(folder: &str, seq: u32, sender: Option<&str>, with_body: bool) -> Vec<u8> {
    let from = sender
        .map(str::to_string)
        .unwrap_or_else(|| format!("sender{}@example.org", seq));
    let mut raw = format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: Message {}\r\nMessage-ID: <{}-{}@example.com>\r\nDate: Tue, 1 Jul 2025 10:00:00 +0000\r\n\r\n",
        from, seq, folder, seq
    );
    if with_body {
        raw.push_str(&format!("Hello {}\r\n--\r\nSender {}\r\n", seq, seq));
    }
    raw.into_bytes()
}

#[async_trait]
impl MailSession for FakeSession {
    async fn examine(&mut self, folder: &str) -> Result<MailboxStatus> {
        let exists = self
            .folders
            .get(folder)
            .copied()
            .ok_or_else(|| MinerError::Protocol(format!("NO Mailbox doesn't exist: {}", folder)))?;
        lock(&self.state).stats.opens += 1;
        self.selected = Some(folder.to_string());
        self.fetched_since_open = false;
        Ok(MailboxStatus { exists })
    }

    fn fetch_range<'a>(
        &'a mut self,
        range: &str,
        with_body: bool,
    ) -> BoxStream<'a, Result<RawMessage>> {
        let Some(folder) = self.selected.clone() else {
            return stream::once(async {
                Err(MinerError::Protocol("BAD No mailbox selected".into()))
            })
            .boxed();
        };
        self.fetched_since_open = true;
        let exists = self.folders.get(&folder).copied().unwrap_or(0);

        let (failure, delay, sender, corrupted) = {
            let mut state = lock(&self.state);
            state.stats.fetches += 1;
            let call = FetchCall {
                folder: folder.clone(),
                range: range.to_string(),
                index: state.stats.fetches,
            };
            let expired = self
                .token
                .as_ref()
                .is_some_and(|token| state.expired_tokens.contains(token));
            let failure = if expired {
                Some(MinerError::auth(
                    "[AUTHENTICATIONFAILED] Invalid credentials (token expired)",
                    true,
                ))
            } else {
                state.fetch_failure.as_ref().and_then(|f| f(&call))
            };
            let corrupted: HashSet<u32> = state
                .corrupted
                .iter()
                .filter(|(f, _)| *f == folder)
                .map(|(_, seq)| *seq)
                .collect();
            (failure, state.message_delay, state.sender.clone(), corrupted)
        };

        if let Some(err) = failure {
            return stream::once(async move { Err(err) }).boxed();
        }

        let (start, end) = parse_range(range, exists);
        stream::iter(start..=end)
            .then(move |seq| {
                let raw = if corrupted.contains(&seq) {
                    // A header may not start with a space
                    b" broken\r\n\r\n".to_vec()
                } else {
                    fake_message(&folder, seq, sender.as_deref(), with_body)
                };
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(RawMessage {
                        seq,
                        raw,
                        includes_body: with_body,
                    })
                }
            })
            .boxed()
    }

    async fn close_mailbox(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.stats.closes += 1;
        self.selected = None;
        if self.fetched_since_open && state.close_failures > 0 {
            state.close_failures -= 1;
            return Err(MinerError::network(
                NetworkErrorKind::ConnectionLost,
                "connection reset during CLOSE",
            ));
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        if self.retire() {
            lock(&self.state).stats.logouts += 1;
        }
        Ok(())
    }
}

/// Token refresher that counts its calls.
pub struct CountingRefresher {
    calls: AtomicUsize,
    token: Option<String>,
}

impl CountingRefresher {
    pub fn succeeding(token: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            token: Some(token.to_string()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            token: None,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self) -> std::result::Result<OAuthTokens, OAuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.token {
            Some(token) => Ok(OAuthTokens {
                access_token: token.clone(),
                refresh_token: Some("refresh".into()),
                expires_at: None,
            }),
            None => Err(OAuthError::RefreshFailed("invalid_grant".into())),
        }
    }
}

/// Stage store kept in a map
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, StageRecord>>,
    fail_updates: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, StageRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for MemoryTaskStore {
    fn insert_stage(&self, record: &StageRecord) -> Result<()> {
        self.records().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn update_stage(&self, record: &StageRecord) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(MinerError::Database("database is locked".into()));
        }
        match self.records().get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(MinerError::NotFound(record.id.clone())),
        }
    }

    fn get_stage(&self, id: &str) -> Result<Option<StageRecord>> {
        Ok(self.records().get(id).cloned())
    }
}

/// Sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingSink {
    fn send(&self, event: &str, data: Value) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.to_string(), data));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fetch service that records calls and reports a fixed total.
pub struct StubFetchService {
    total: u64,
    start_error: Mutex<Option<MinerError>>,
    starts: Mutex<Vec<FetchStartRequest>>,
    stops: Mutex<Vec<FetchStopRequest>>,
    stop_delay: Mutex<Duration>,
    late_append: Mutex<Option<(Arc<dyn Broker>, String)>>,
}

impl StubFetchService {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            start_error: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            stop_delay: Mutex::new(Duration::ZERO),
            late_append: Mutex::new(None),
        })
    }

    /// Every stop takes `delay` before it returns.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Like a fetcher winding down, append one entry to `stream` while stopping.
    pub fn append_on_stop(&self, broker: Arc<dyn Broker>, stream: &str) {
        *self
            .late_append
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((broker, stream.to_string()));
    }

    pub fn fail_start(&self, err: MinerError) {
        *self
            .start_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    pub fn starts(&self) -> Vec<FetchStartRequest> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stops(&self) -> Vec<FetchStopRequest> {
        self.stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl FetchService for StubFetchService {
    async fn start(&self, request: FetchStartRequest) -> Result<FetchStartResponse> {
        let error = self
            .start_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(err) = error {
            return Err(err);
        }
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(FetchStartResponse {
            total_messages: self.total,
        })
    }

    async fn stop(&self, request: FetchStopRequest) -> Result<()> {
        let delay = *self.stop_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let late_append = self
            .late_append
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((broker, stream)) = late_append {
            broker.append(&stream, "{}".into()).await?;
        }
        // recorded last, so a visible stop has finished its work
        self.stops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}
