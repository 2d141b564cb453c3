//! Mining task orchestrator
//!
//! A [`TasksManager`] handle sends commands to a single actor task that owns
//! the registry of running tasks. Progress events published by the fetch
//! engine and the downstream workers arrive on the broker channel named by
//! the mining id and are funneled into the same command queue, so the state
//! of a task is only ever mutated from one place.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::sink::ProgressSink;
use super::store::TaskStore;
use crate::adapters::broker::{publish_json, Broker};
use crate::services::fetch::FetchService;
use crate::types::error::{MinerError, Result};
use crate::types::mining::{
    MiningTask, Progress, Stage, StageKind, StageRecord, StageStatus, Stages, TaskStreams,
};
use crate::types::records::{
    FetchStartRequest, FetchStopRequest, ProgressCounter, ProgressEvent, ProgressType,
    StreamCommand, StreamControl, STREAM_CONTROL_CHANNEL,
};

pub const MINING_COMPLETED_EVENT: &str = "mining-completed";
pub const MINING_CANCELED_EVENT: &str = "mining-canceled";

/// Produces task and stage ids
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn uuid_ids() -> IdGenerator {
    Arc::new(|| Uuid::new_v4().to_string())
}

/// What a caller asks to mine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningRequest {
    pub user_id: String,
    pub email: String,
    pub boxes: Vec<String>,
    pub extract_signatures: bool,
}

enum Command {
    Create {
        request: MiningRequest,
        reply: oneshot::Sender<Result<MiningTask>>,
    },
    Get {
        task_id: String,
        reply: oneshot::Sender<Option<MiningTask>>,
    },
    ActiveForUser {
        user_id: String,
        reply: oneshot::Sender<Option<MiningTask>>,
    },
    AttachSink {
        task_id: String,
        sink: Arc<dyn ProgressSink>,
        reply: oneshot::Sender<Result<()>>,
    },
    Notify {
        task_id: String,
        counter: ProgressCounter,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        task_id: String,
        stage_ids: Option<Vec<String>>,
        reply: oneshot::Sender<Result<MiningTask>>,
    },
    Progress(ProgressEvent),
    /// The fetch service acknowledged a stop
    FetchStopped {
        mining_id: String,
    },
}

/// Handle to the orchestrator. Cheap to clone; the actor stops once every
/// handle is dropped and no task is still subscribed to progress.
#[derive(Clone)]
pub struct TasksManager {
    commands: flume::Sender<Command>,
}

fn manager_stopped() -> MinerError {
    MinerError::Other("tasks manager stopped".into())
}

impl TasksManager {
    /// Start the actor on the current runtime.
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        fetch: Arc<dyn FetchService>,
        ids: IdGenerator,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let actor = TasksActor {
            tasks: HashMap::new(),
            store,
            broker,
            fetch,
            ids,
            commands: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { commands: tx }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send_async(command(reply))
            .await
            .map_err(|_| manager_stopped())?;
        rx.await.map_err(|_| manager_stopped())
    }

    /// Create the three stages, register the streams and start fetching.
    pub async fn create_task(&self, request: MiningRequest) -> Result<MiningTask> {
        self.call(|reply| Command::Create { request, reply }).await?
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<MiningTask>> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::Get { task_id, reply }).await
    }

    pub async fn active_task_for_user(&self, user_id: &str) -> Result<Option<MiningTask>> {
        let user_id = user_id.to_string();
        self.call(|reply| Command::ActiveForUser { user_id, reply })
            .await
    }

    /// Register a live-update handler for a running task.
    pub async fn attach_sink(&self, task_id: &str, sink: Arc<dyn ProgressSink>) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::AttachSink {
            task_id,
            sink,
            reply,
        })
        .await?
    }

    /// Send the current value of `counter` to the task's handlers.
    pub async fn notify_progress(&self, task_id: &str, counter: ProgressCounter) -> Result<()> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::Notify {
            task_id,
            counter,
            reply,
        })
        .await?
    }

    /// Stop the given stages (every unstopped one when `None`). The task
    /// leaves the registry once all three stages are stopped.
    pub async fn delete_task(
        &self,
        task_id: &str,
        stage_ids: Option<Vec<String>>,
    ) -> Result<MiningTask> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::Delete {
            task_id,
            stage_ids,
            reply,
        })
        .await?
    }

    /// Feed a progress event without going through the broker.
    pub async fn report_progress(&self, event: ProgressEvent) -> Result<()> {
        self.commands
            .send_async(Command::Progress(event))
            .await
            .map_err(|_| manager_stopped())
    }
}

struct TaskEntry {
    task: MiningTask,
    streams: TaskStreams,
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl TaskEntry {
    fn notify(&self, counter: ProgressCounter) {
        let value = self.task.progress.value(counter);
        for sink in &self.sinks {
            sink.send(counter.event_name(), json!(value));
        }
    }

    /// A stage may finish only after its upstream stage stopped.
    fn ready_to_finish(&self, kind: StageKind) -> bool {
        let stages = &self.task.stages;
        let progress = &self.task.progress;
        if stages.get(kind).is_stopped() {
            return false;
        }
        let upstream_stopped = kind
            .upstream()
            .map(|upstream| stages.get(upstream).is_stopped())
            .unwrap_or(false);
        if !upstream_stopped {
            return false;
        }
        match kind {
            StageKind::Fetch => false,
            StageKind::Extract => progress.extracted >= progress.fetched,
            StageKind::Clean => progress.verified_contacts >= progress.created_contacts,
        }
    }
}

struct TasksActor {
    tasks: HashMap<String, TaskEntry>,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    fetch: Arc<dyn FetchService>,
    ids: IdGenerator,
    commands: flume::WeakSender<Command>,
}

impl TasksActor {
    async fn run(mut self, commands: flume::Receiver<Command>) {
        while let Ok(command) = commands.recv_async().await {
            self.handle(command).await;
        }
        debug!(running = self.tasks.len(), "Tasks manager stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            Command::Get { task_id, reply } => {
                let _ = reply.send(self.tasks.get(&task_id).map(|entry| entry.task.clone()));
            }
            Command::ActiveForUser { user_id, reply } => {
                let task = self
                    .tasks
                    .values()
                    .find(|entry| entry.task.user_id == user_id)
                    .map(|entry| entry.task.clone());
                let _ = reply.send(task);
            }
            Command::AttachSink {
                task_id,
                sink,
                reply,
            } => {
                let result = match self.tasks.get_mut(&task_id) {
                    Some(entry) => {
                        entry.sinks.push(sink);
                        Ok(())
                    }
                    None => Err(unknown_task(&task_id)),
                };
                let _ = reply.send(result);
            }
            Command::Notify {
                task_id,
                counter,
                reply,
            } => {
                let result = match self.tasks.get(&task_id) {
                    Some(entry) => {
                        entry.notify(counter);
                        Ok(())
                    }
                    None => Err(unknown_task(&task_id)),
                };
                let _ = reply.send(result);
            }
            Command::Delete {
                task_id,
                stage_ids,
                reply,
            } => {
                let _ = reply.send(self.delete(&task_id, stage_ids).await);
            }
            Command::Progress(event) => self.on_progress(event).await,
            Command::FetchStopped { mining_id } => {
                // A fetcher that was still winding down may have appended
                // after the task finished
                if !self.tasks.contains_key(&mining_id) {
                    self.sweep_streams(&mining_id).await;
                }
            }
        }
    }

    async fn create(&mut self, request: MiningRequest) -> Result<MiningTask> {
        if request.user_id.trim().is_empty() || request.email.trim().is_empty() {
            return Err(MinerError::InvalidInput("userId and email are required".into()));
        }
        if self
            .tasks
            .values()
            .any(|entry| entry.task.user_id == request.user_id)
        {
            return Err(MinerError::InvalidInput(format!(
                "user {} already has a mining task running",
                request.user_id
            )));
        }

        let mining_id = (self.ids)();
        let streams = TaskStreams::for_mining(&mining_id);
        let now = Utc::now();
        let task = MiningTask {
            task_id: mining_id.clone(),
            user_id: request.user_id.clone(),
            stages: Stages {
                fetch: Stage::new(
                    (self.ids)(),
                    StageKind::Fetch,
                    json!({
                        "miningId": mining_id,
                        "email": request.email,
                        "boxes": request.boxes,
                        "extractSignatures": request.extract_signatures,
                    }),
                    now,
                ),
                extract: Stage::new(
                    (self.ids)(),
                    StageKind::Extract,
                    json!({
                        "miningId": mining_id,
                        "messagesStream": streams.messages_stream,
                        "signaturesStream": streams.signatures_stream,
                    }),
                    now,
                ),
                clean: Stage::new(
                    (self.ids)(),
                    StageKind::Clean,
                    json!({
                        "miningId": mining_id,
                        "emailsStream": streams.emails_stream,
                    }),
                    now,
                ),
            },
            progress: Progress::default(),
            started_at: now,
        };

        for stage in task.stages.iter() {
            self.store
                .insert_stage(&StageRecord::from_stage(&task.user_id, stage))?;
        }

        self.tasks.insert(
            mining_id.clone(),
            TaskEntry {
                task,
                streams: streams.clone(),
                sinks: Vec::new(),
            },
        );

        if let Err(e) = self.register(&mining_id, &streams).await {
            error!(mining_id = %mining_id, error = %e, "Failed to register task streams");
            self.discard(&mining_id).await;
            return Err(e);
        }

        let started = self
            .fetch
            .start(FetchStartRequest {
                user_id: request.user_id.clone(),
                mining_id: mining_id.clone(),
                email: request.email.clone(),
                boxes: request.boxes.clone(),
                extract_signatures: request.extract_signatures,
                contact_stream: streams.messages_stream.clone(),
                signature_stream: streams.signatures_stream.clone(),
            })
            .await;

        let response = match started {
            Ok(response) => response,
            Err(e) => {
                error!(mining_id = %mining_id, error = %e, "Fetch failed to start, discarding task");
                self.discard(&mining_id).await;
                return Err(e);
            }
        };

        let Some(entry) = self.tasks.get_mut(&mining_id) else {
            return Err(unknown_task(&mining_id));
        };
        entry.task.progress.total_messages = response.total_messages;
        entry.notify(ProgressCounter::TotalMessages);
        info!(
            mining_id = %mining_id,
            user_id = %request.user_id,
            total_messages = response.total_messages,
            "Mining task created"
        );
        Ok(entry.task.clone())
    }

    /// Create the consumer groups, announce them and subscribe to progress.
    async fn register(&self, mining_id: &str, streams: &TaskStreams) -> Result<()> {
        for (stream, group) in streams.all() {
            self.broker.create_group(stream, group).await?;
            let control = StreamControl {
                mining_id: mining_id.to_string(),
                command: StreamCommand::Register,
                stream_name: stream.to_string(),
                consumer_group: group.to_string(),
            };
            publish_json(self.broker.as_ref(), STREAM_CONTROL_CHANNEL, &control).await?;
        }

        let subscription = self.broker.subscribe(mining_id).await?;
        let Some(commands) = self.commands.upgrade() else {
            return Err(manager_stopped());
        };
        let channel = mining_id.to_string();
        tokio::spawn(async move {
            while let Ok(payload) = subscription.recv_async().await {
                match serde_json::from_str::<ProgressEvent>(&payload) {
                    Ok(event) => {
                        if commands.send_async(Command::Progress(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Ignoring malformed progress event"),
                }
            }
            debug!(channel = %channel, "Progress forwarding ended");
        });
        Ok(())
    }

    /// Tear down a task whose fetch never started.
    async fn discard(&mut self, mining_id: &str) {
        let Some(entry) = self.tasks.get_mut(mining_id) else {
            return;
        };
        let now = Utc::now();
        for kind in StageKind::ALL {
            let stage = entry.task.stages.get_mut(kind);
            if stage.stop(StageStatus::Canceled, now) {
                let record = StageRecord::from_stage(&entry.task.user_id, stage);
                if let Err(e) = self.store.update_stage(&record) {
                    warn!(mining_id = %mining_id, stage = kind.as_str(), error = %e, "Failed to persist stage");
                }
            }
        }
        let streams = entry.streams.clone();
        for (stream, group) in streams.all() {
            self.remove_stream(mining_id, stream, group).await;
        }
        self.finish(mining_id).await;
    }

    async fn on_progress(&mut self, event: ProgressEvent) {
        let mining_id = event.mining_id.clone();
        let Some(entry) = self.tasks.get_mut(&mining_id) else {
            debug!(mining_id = %mining_id, "Progress for unknown task ignored");
            return;
        };

        entry.task.progress.apply(event.progress_type, event.count);
        entry.notify(event.progress_type.into());

        if event.progress_type == ProgressType::Fetched {
            if event.is_canceled {
                info!(mining_id = %mining_id, "Fetch canceled, canceling task");
                self.stop_stages(&mining_id, &StageKind::ALL, StageStatus::Canceled)
                    .await;
                return;
            }
            if event.is_completed {
                self.stop_stages(&mining_id, &[StageKind::Fetch], StageStatus::Done)
                    .await;
            }
        }

        self.advance(&mining_id).await;
    }

    /// Finish downstream stages whose predicates now hold, in pipeline order.
    async fn advance(&mut self, mining_id: &str) {
        for kind in [StageKind::Extract, StageKind::Clean] {
            let ready = match self.tasks.get(mining_id) {
                Some(entry) => entry.ready_to_finish(kind),
                None => return,
            };
            if ready {
                self.stop_stages(mining_id, &[kind], StageStatus::Done).await;
            }
        }
    }

    async fn delete(
        &mut self,
        mining_id: &str,
        stage_ids: Option<Vec<String>>,
    ) -> Result<MiningTask> {
        let entry = self
            .tasks
            .get(mining_id)
            .ok_or_else(|| unknown_task(mining_id))?;

        let kinds = match stage_ids {
            None => StageKind::ALL.to_vec(),
            Some(ids) => ids
                .iter()
                .map(|id| {
                    entry.task.stages.by_id(id).ok_or_else(|| {
                        MinerError::InvalidInput(format!("stage {} is not part of {}", id, mining_id))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        info!(mining_id = %mining_id, stages = ?kinds, "Deleting task stages");
        self.stop_stages(mining_id, &kinds, StageStatus::Canceled)
            .await
            .ok_or_else(|| unknown_task(mining_id))
    }

    /// Stop each stage of `kinds` still running, persist it and release what
    /// it owned. Returns the task as it stands afterwards.
    async fn stop_stages(
        &mut self,
        mining_id: &str,
        kinds: &[StageKind],
        status: StageStatus,
    ) -> Option<MiningTask> {
        let entry = self.tasks.get_mut(mining_id)?;
        let now = Utc::now();

        let mut stopped = Vec::new();
        for kind in kinds {
            let stage = entry.task.stages.get_mut(*kind);
            if !stage.stop(status, now) {
                continue;
            }
            info!(
                mining_id = %mining_id,
                stage = kind.as_str(),
                status = status.as_str(),
                duration_ms = stage.duration.unwrap_or_default(),
                "Stage stopped"
            );
            let record = StageRecord::from_stage(&entry.task.user_id, stage);
            if let Err(e) = self.store.update_stage(&record) {
                warn!(mining_id = %mining_id, stage = kind.as_str(), error = %e, "Failed to persist stage");
            }
            stopped.push(*kind);
        }

        let streams = entry.streams.clone();
        let snapshot = entry.task.clone();
        let all_stopped = entry.task.stages.all_stopped();

        for kind in stopped {
            match kind {
                StageKind::Fetch => {
                    self.stop_fetch(mining_id, status == StageStatus::Canceled);
                }
                StageKind::Extract | StageKind::Clean => {
                    for (stream, group) in streams.consumed_by(kind) {
                        self.remove_stream(mining_id, stream, group).await;
                    }
                }
            }
        }

        if all_stopped {
            self.finish(mining_id).await;
        }
        Some(snapshot)
    }

    /// Ask the fetch service to stop without waiting on it here: a stop
    /// lasts as long as the fetcher's in-flight units.
    fn stop_fetch(&self, mining_id: &str, canceled: bool) {
        let fetch = self.fetch.clone();
        let commands = self.commands.clone();
        let request = FetchStopRequest {
            mining_id: mining_id.to_string(),
            canceled,
        };
        tokio::spawn(async move {
            let mining_id = request.mining_id.clone();
            if let Err(e) = fetch.stop(request).await {
                warn!(mining_id = %mining_id, error = %e, "Failed to stop fetch");
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands
                    .send_async(Command::FetchStopped { mining_id })
                    .await;
            }
        });
    }

    /// Delete every stream of a finished task, whoever created it.
    async fn sweep_streams(&self, mining_id: &str) {
        let streams = TaskStreams::for_mining(mining_id);
        for (stream, _) in streams.all() {
            if let Err(e) = self.broker.delete_stream(stream).await {
                warn!(mining_id = %mining_id, stream, error = %e, "Failed to delete stream");
            }
        }
    }

    async fn remove_stream(&self, mining_id: &str, stream: &str, group: &str) {
        if let Err(e) = self.broker.destroy_group(stream, group).await {
            warn!(mining_id = %mining_id, stream, error = %e, "Failed to destroy consumer group");
        }
        if let Err(e) = self.broker.delete_stream(stream).await {
            warn!(mining_id = %mining_id, stream, error = %e, "Failed to delete stream");
        }
        let control = StreamControl {
            mining_id: mining_id.to_string(),
            command: StreamCommand::Delete,
            stream_name: stream.to_string(),
            consumer_group: group.to_string(),
        };
        if let Err(e) = publish_json(self.broker.as_ref(), STREAM_CONTROL_CHANNEL, &control).await {
            warn!(mining_id = %mining_id, stream, error = %e, "Failed to announce stream removal");
        }
    }

    /// Remove a fully stopped task and close its live handlers.
    async fn finish(&mut self, mining_id: &str) {
        let Some(entry) = self.tasks.remove(mining_id) else {
            return;
        };
        if let Err(e) = self.broker.unsubscribe(mining_id).await {
            warn!(mining_id = %mining_id, error = %e, "Failed to unsubscribe from progress");
        }
        self.sweep_streams(mining_id).await;

        let canceled = entry.task.is_canceled();
        let event = if canceled {
            MINING_CANCELED_EVENT
        } else {
            MINING_COMPLETED_EVENT
        };
        let data = json!({
            "miningId": mining_id,
            "progress": entry.task.progress,
        });
        for sink in &entry.sinks {
            sink.send(event, data.clone());
            sink.close();
        }

        let elapsed = Utc::now() - entry.task.started_at;
        info!(
            mining_id = %mining_id,
            canceled,
            fetched = entry.task.progress.fetched,
            elapsed_ms = elapsed.num_milliseconds(),
            "Mining task finished"
        );
    }
}

fn unknown_task(task_id: &str) -> MinerError {
    MinerError::NotFound(format!("task {} does not exist", task_id))
}
