use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::ParsedMessage;
use super::queue::WorkQueue;
use super::work_unit::{partition, WorkUnit};
use crate::adapters::broker::{append_json, publish_json, Broker};
use crate::adapters::imap::{ImapConnectionProvider, PooledSession, RawMessage};
use crate::config::ImapSettings;
use crate::services::logger::fmt_ms;
use crate::types::error::{MinerError, Result};
use crate::types::records::{
    EmailData, FetchStartRequest, HeaderMap, MessageRecord, ProgressEvent, ProgressType, RecordType,
    SignatureEmail, SignatureRecord,
};

/// Snapshot of a fetch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStatus {
    pub mining_id: String,
    pub total_messages: u64,
    pub fetched: u64,
    pub published: u64,
    pub errors: u32,
    pub folders: Vec<(String, u32)>,
    pub is_canceled: bool,
    pub is_completed: bool,
}

/// Fetches one mailbox for one mining job.
///
/// Cheap to clone; all clones drive the same job.
#[derive(Clone)]
pub struct EmailFetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    job: FetchStartRequest,
    user_identifier: String,
    provider: Arc<ImapConnectionProvider>,
    broker: Arc<dyn Broker>,
    settings: ImapSettings,
    queue: WorkQueue,
    max_errors: u32,
    started: Instant,

    total: AtomicU64,
    /// Messages streamed from the server, duplicates included
    fetched: AtomicU64,
    /// Records appended to the messages stream
    published: AtomicU64,
    /// `published` value covered by progress events so far
    reported: AtomicU64,
    errors: AtomicU32,
    canceled: AtomicBool,
    /// Fired on cancel; in-flight units drop their session when it fires
    cancellation: CancellationToken,
    completed: AtomicBool,

    /// Held by the worker refreshing credentials; stores the last refresh
    last_refresh: tokio::sync::Mutex<Option<Instant>>,
    seen: Mutex<HashSet<String>>,
    folders: Mutex<Vec<(String, u32)>>,
    stopped: OnceCell<()>,
}

enum UnitOutcome {
    Finished(u64),
    Aborted,
}

/// Hex SHA-256 of `user_id:email`, identifying a mailbox owner downstream.
pub fn user_identifier(user_id: &str, email: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", user_id, email.to_lowercase()).as_bytes());
    format!("{:x}", digest)
}

/// `ceil(1.5 × max_connections)`
pub fn error_budget(max_connections: usize) -> u32 {
    ((max_connections as u32) * 3).div_ceil(2)
}

impl EmailFetcher {
    pub fn new(
        job: FetchStartRequest,
        provider: Arc<ImapConnectionProvider>,
        broker: Arc<dyn Broker>,
        settings: ImapSettings,
    ) -> Self {
        let max_connections = provider.max_connections();
        Self {
            inner: Arc::new(FetcherInner {
                user_identifier: user_identifier(&job.user_id, &job.email),
                queue: WorkQueue::new(max_connections, settings.task_spacing()),
                max_errors: error_budget(max_connections),
                started: Instant::now(),
                job,
                provider,
                broker,
                settings,
                total: AtomicU64::new(0),
                fetched: AtomicU64::new(0),
                published: AtomicU64::new(0),
                reported: AtomicU64::new(0),
                errors: AtomicU32::new(0),
                canceled: AtomicBool::new(false),
                cancellation: CancellationToken::new(),
                completed: AtomicBool::new(false),
                last_refresh: tokio::sync::Mutex::new(None),
                seen: Mutex::new(HashSet::new()),
                folders: Mutex::new(Vec::new()),
                stopped: OnceCell::new(),
            }),
        }
    }

    pub fn mining_id(&self) -> &str {
        &self.inner.job.mining_id
    }

    /// Count every folder, queue the work units and return the total.
    /// The job stops by itself once the queue drains.
    pub async fn start(&self) -> Result<u64> {
        let inner = &self.inner;
        let folders: Vec<&String> = inner
            .job
            .boxes
            .iter()
            .filter(|folder| !inner.settings.is_excluded(folder))
            .collect();
        info!(mining_id = %inner.job.mining_id, folders = folders.len(), "Starting fetch");

        let totals = try_join_all(folders.iter().map(|folder| inner.count_folder(folder))).await?;

        let mut total = 0u64;
        let mut units = Vec::new();
        for (folder, count) in &totals {
            info!(mining_id = %inner.job.mining_id, folder = %folder, total = count, "Folder total");
            total += u64::from(*count);
            units.extend(partition(folder, *count, inner.settings.fetch_chunk_size));
        }
        inner.total.store(total, Ordering::SeqCst);
        *inner.folders.lock().unwrap_or_else(PoisonError::into_inner) = totals;

        debug!(mining_id = %inner.job.mining_id, units = units.len(), "Queueing work units");
        for unit in units {
            inner.enqueue(unit);
        }

        let watcher = self.clone();
        tokio::spawn(async move {
            watcher.inner.queue.on_idle().await;
            watcher.stop(false).await;
        });

        Ok(total)
    }

    /// Stop the job, canceling in-flight work if `cancel`. Later calls wait
    /// for the first one and change nothing.
    pub async fn stop(&self, cancel: bool) {
        if cancel {
            self.inner.cancel();
        }
        self.inner
            .stopped
            .get_or_init(|| self.inner.shutdown())
            .await;
    }

    /// Release the pool of a job that never started.
    pub async fn discard(&self) {
        self.inner.cancel();
        self.inner.provider.clean_pool().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.initialized()
    }

    pub fn status(&self) -> FetchStatus {
        let inner = &self.inner;
        FetchStatus {
            mining_id: inner.job.mining_id.clone(),
            total_messages: inner.total.load(Ordering::SeqCst),
            fetched: inner.fetched.load(Ordering::SeqCst),
            published: inner.published.load(Ordering::SeqCst),
            errors: inner.errors.load(Ordering::SeqCst),
            folders: inner
                .folders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            is_canceled: inner.is_canceled(),
            is_completed: inner.completed.load(Ordering::SeqCst),
        }
    }
}

impl FetcherInner {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::SeqCst) {
            info!(mining_id = %self.job.mining_id, "Fetch canceled");
        }
        self.cancellation.cancel();
        self.queue.clear();
    }

    async fn count_folder(&self, folder: &str) -> Result<(String, u32)> {
        let mut session = self.provider.acquire_connection().await?;
        let counted = async {
            let status = session.examine(folder).await?;
            session.close_mailbox().await?;
            Ok::<_, MinerError>(status.exists)
        }
        .await;

        match counted {
            Ok(exists) => {
                self.provider.release_connection(session).await;
                Ok((folder.to_string(), exists))
            }
            Err(e) => {
                self.provider.destroy_connection(session).await;
                Err(e)
            }
        }
    }

    fn enqueue(self: &Arc<Self>, unit: WorkUnit) {
        self.queue.add(self.clone().run_unit(unit));
    }

    // Boxed: failures requeue units, so this future is built from inside itself
    fn run_unit(self: Arc<Self>, unit: WorkUnit) -> BoxFuture<'static, ()> {
        async move {
            if self.is_canceled() {
                return;
            }
            let started = Instant::now();
            debug!(mining_id = %self.job.mining_id, folder = %unit.folder, range = %unit.range, "Work unit started");

            match self.fetch_unit(&unit).await {
                Ok(UnitOutcome::Finished(count)) => {
                    debug!(mining_id = %self.job.mining_id, folder = %unit.folder, range = %unit.range, messages = count, elapsed = %fmt_ms(started.elapsed()), "Work unit finished");
                }
                Ok(UnitOutcome::Aborted) => {
                    debug!(mining_id = %self.job.mining_id, folder = %unit.folder, range = %unit.range, "Work unit aborted");
                }
                Err(e) => self.handle_failure(unit, e).await,
            }
        }
        .boxed()
    }

    async fn fetch_unit(&self, unit: &WorkUnit) -> Result<UnitOutcome> {
        let mut session = tokio::select! {
            _ = self.cancellation.cancelled() => return Ok(UnitOutcome::Aborted),
            session = self.provider.acquire_connection() => session?,
        };
        // A canceled job does not wait for the server's next message
        let streamed = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Ok(UnitOutcome::Aborted),
            streamed = self.stream_unit(&mut session, unit) => streamed,
        };
        match streamed {
            Ok(UnitOutcome::Finished(count)) => {
                self.provider.release_connection(session).await;
                Ok(UnitOutcome::Finished(count))
            }
            Ok(UnitOutcome::Aborted) => {
                // Mid-fetch: the session state is unknown
                self.provider.destroy_connection(session).await;
                Ok(UnitOutcome::Aborted)
            }
            Err(e) => {
                self.provider.destroy_connection(session).await;
                Err(e)
            }
        }
    }

    async fn stream_unit(
        &self,
        session: &mut PooledSession,
        unit: &WorkUnit,
    ) -> Result<UnitOutcome> {
        session.examine(&unit.folder).await?;

        let mut count = 0u64;
        {
            let mut messages = session.fetch_range(&unit.range.to_string(), self.settings.fetch_body);
            while let Some(message) = messages.next().await {
                if self.is_canceled() {
                    return Ok(UnitOutcome::Aborted);
                }
                let message = message?;
                count += 1;
                self.handle_message(unit, message).await?;
            }
        }

        session.close_mailbox().await?;
        Ok(UnitOutcome::Finished(count))
    }

    async fn handle_message(&self, unit: &WorkUnit, message: RawMessage) -> Result<()> {
        self.fetched.fetch_add(1, Ordering::SeqCst);

        // The last message of a folder is always sent: it marks the folder done
        let is_last = message.seq == unit.total_in_folder;
        let parsed = match ParsedMessage::parse(&message.raw, message.includes_body) {
            Ok(parsed) => parsed,
            Err(e) if is_last => {
                warn!(mining_id = %self.job.mining_id, folder = %unit.folder, seq = message.seq, error = %e, "Last message unparseable, sending bare folder marker");
                let record = self.message_record(unit, HeaderMap::new(), None, message.seq, true);
                append_json(self.broker.as_ref(), &self.job.contact_stream, &record).await?;
                return self.count_published().await;
            }
            Err(e) => {
                warn!(mining_id = %self.job.mining_id, folder = %unit.folder, seq = message.seq, error = %e, "Skipping unparseable message");
                return Ok(());
            }
        };

        let message_id = parsed.message_id();
        let first_seen = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.clone());
        if !first_seen && !is_last {
            return Ok(());
        }

        let body = if self.settings.fetch_body && !parsed.is_from(&self.job.email) {
            parsed.body.clone()
        } else {
            None
        };
        let from = parsed.first("from").map(str::to_string);
        let date = parsed.first("date").map(str::to_string);

        let record = self.message_record(unit, parsed.header, body.clone(), message.seq, is_last);
        append_json(self.broker.as_ref(), &self.job.contact_stream, &record).await?;

        if self.job.extract_signatures {
            if let Some(body) = body {
                let signature = SignatureRecord {
                    user_id: self.job.user_id.clone(),
                    mining_id: self.job.mining_id.clone(),
                    email: Some(SignatureEmail {
                        message_id,
                        from,
                        date,
                        body,
                    }),
                    is_last: false,
                };
                append_json(self.broker.as_ref(), &self.job.signature_stream, &signature).await?;
            }
        }

        self.count_published().await
    }

    fn message_record(
        &self,
        unit: &WorkUnit,
        header: HeaderMap,
        body: Option<String>,
        seq: u32,
        is_last: bool,
    ) -> MessageRecord {
        MessageRecord {
            record_type: RecordType::Email,
            data: EmailData {
                header,
                body,
                seq_number: seq,
                folder_path: unit.folder.clone(),
                is_last,
            },
            user_id: self.job.user_id.clone(),
            user_email: self.job.email.clone(),
            user_identifier: self.user_identifier.clone(),
            mining_id: self.job.mining_id.clone(),
        }
    }

    async fn count_published(&self) -> Result<()> {
        let published = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        if published % self.settings.progress_batch_size == 0 {
            self.report_progress(false).await;
        }
        Ok(())
    }

    async fn handle_failure(self: &Arc<Self>, unit: WorkUnit, err: MinerError) {
        if self.is_canceled() {
            debug!(mining_id = %self.job.mining_id, error = %err, "Ignoring failure of canceled job");
            return;
        }

        if err.is_auth() {
            if self.provider.is_oauth() {
                self.coordinate_refresh(unit, err).await;
            } else {
                error!(mining_id = %self.job.mining_id, error = %err, "Authentication failed, canceling fetch");
                self.cancel();
            }
            return;
        }

        if matches!(err, MinerError::Config { .. }) {
            error!(mining_id = %self.job.mining_id, error = %err, "Invalid configuration, canceling fetch");
            self.cancel();
            return;
        }

        self.count_failure(unit, err);
    }

    /// Retry `unit` unless the error budget is spent.
    fn count_failure(self: &Arc<Self>, unit: WorkUnit, err: MinerError) {
        let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if errors >= self.max_errors {
            error!(mining_id = %self.job.mining_id, errors, max_errors = self.max_errors, error = %err, "Error budget exhausted, canceling fetch");
            self.cancel();
        } else {
            warn!(mining_id = %self.job.mining_id, folder = %unit.folder, range = %unit.range, errors, max_errors = self.max_errors, error = %err, "Work unit failed, retrying");
            self.enqueue(unit);
        }
    }

    /// One worker refreshes the token while the queue is paused; the
    /// others requeue their unit and wait for the queue to resume.
    async fn coordinate_refresh(self: &Arc<Self>, unit: WorkUnit, err: MinerError) {
        let Ok(mut last_refresh) = self.last_refresh.try_lock() else {
            debug!(mining_id = %self.job.mining_id, "Refresh already in progress, requeueing");
            self.enqueue(unit);
            return;
        };

        if let Some(at) = *last_refresh {
            if at.elapsed() < self.settings.refresh_cooldown() {
                drop(last_refresh);
                self.count_failure(unit, err);
                return;
            }
        }

        info!(mining_id = %self.job.mining_id, error = %err, "Access token rejected, refreshing");
        self.errors.store(0, Ordering::SeqCst);
        self.queue.pause();
        // This worker is still pending; wait for every other one to finish
        self.queue.on_pending_at_most(1).await;

        let outcome = self.provider.refresh_oauth_token().await;
        *last_refresh = Some(Instant::now());
        drop(last_refresh);

        match outcome {
            Ok(()) => {
                info!(mining_id = %self.job.mining_id, "Token refreshed, resuming fetch");
                self.enqueue(unit);
            }
            Err(e) => {
                error!(mining_id = %self.job.mining_id, error = %e, "Token refresh failed, canceling fetch");
                self.cancel();
            }
        }
        self.queue.resume();
    }

    /// Publish the fetched count accumulated since the last event.
    async fn report_progress(&self, final_event: bool) {
        let published = self.published.load(Ordering::SeqCst);
        let previous = self.reported.fetch_max(published, Ordering::SeqCst);
        let count = published.saturating_sub(previous);
        if count == 0 && !final_event {
            return;
        }

        let event = ProgressEvent {
            mining_id: self.job.mining_id.clone(),
            progress_type: ProgressType::Fetched,
            count,
            is_completed: final_event && self.completed.load(Ordering::SeqCst),
            is_canceled: final_event && self.is_canceled(),
        };
        if let Err(e) = publish_json(self.broker.as_ref(), &self.job.mining_id, &event).await {
            warn!(mining_id = %self.job.mining_id, error = %e, "Failed to publish progress");
        }
    }

    async fn shutdown(&self) {
        self.queue.on_idle().await;

        let canceled = self.is_canceled();
        if !canceled {
            self.completed.store(true, Ordering::SeqCst);
        }

        self.provider.clean_pool().await;

        if self.job.extract_signatures {
            let sentinel = SignatureRecord {
                user_id: self.job.user_id.clone(),
                mining_id: self.job.mining_id.clone(),
                email: None,
                is_last: true,
            };
            if let Err(e) =
                append_json(self.broker.as_ref(), &self.job.signature_stream, &sentinel).await
            {
                warn!(mining_id = %self.job.mining_id, error = %e, "Failed to send signature sentinel");
            }
        }

        self.report_progress(true).await;

        info!(
            mining_id = %self.job.mining_id,
            total = self.total.load(Ordering::SeqCst),
            fetched = self.fetched.load(Ordering::SeqCst),
            published = self.published.load(Ordering::SeqCst),
            canceled,
            elapsed = %fmt_ms(self.started.elapsed()),
            "Fetch stopped"
        );
    }
}
