use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::{ProgressCounter, ProgressType};

/// The three pipeline phases of a mining task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Fetch,
    Extract,
    Clean,
}

impl StageKind {
    /// Upstream first.
    pub const ALL: [StageKind; 3] = [StageKind::Fetch, StageKind::Extract, StageKind::Clean];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::Extract => "extract",
            StageKind::Clean => "clean",
        }
    }

    pub fn upstream(&self) -> Option<StageKind> {
        match self {
            StageKind::Fetch => None,
            StageKind::Extract => Some(StageKind::Fetch),
            StageKind::Clean => Some(StageKind::Extract),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Done,
    Canceled,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(StageStatus::Running),
            "done" => Some(StageStatus::Done),
            "canceled" => Some(StageStatus::Canceled),
            _ => None,
        }
    }
}

/// One stage of a mining task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StageKind,
    pub status: StageStatus,
    pub details: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Milliseconds between start and stop
    pub duration: Option<i64>,
}

impl Stage {
    pub fn new(id: String, kind: StageKind, details: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: StageStatus::Running,
            details,
            started_at: now,
            stopped_at: None,
            duration: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Stop the stage. Returns false (and changes nothing) if it had
    /// already stopped: `stopped_at` and `duration` are written once.
    pub fn stop(&mut self, status: StageStatus, at: DateTime<Utc>) -> bool {
        if self.stopped_at.is_some() {
            return false;
        }
        self.status = status;
        self.stopped_at = Some(at);
        self.duration = Some((at - self.started_at).num_milliseconds().max(0));
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stages {
    pub fetch: Stage,
    pub extract: Stage,
    pub clean: Stage,
}

impl Stages {
    pub fn get(&self, kind: StageKind) -> &Stage {
        match kind {
            StageKind::Fetch => &self.fetch,
            StageKind::Extract => &self.extract,
            StageKind::Clean => &self.clean,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut Stage {
        match kind {
            StageKind::Fetch => &mut self.fetch,
            StageKind::Extract => &mut self.extract,
            StageKind::Clean => &mut self.clean,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        [&self.fetch, &self.extract, &self.clean].into_iter()
    }

    pub fn all_stopped(&self) -> bool {
        self.iter().all(Stage::is_stopped)
    }

    pub fn by_id(&self, id: &str) -> Option<StageKind> {
        self.iter().find(|s| s.id == id).map(|s| s.kind)
    }
}

/// Per-task counters, fed by progress events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_messages: u64,
    pub fetched: u64,
    pub extracted: u64,
    pub created_contacts: u64,
    pub verified_contacts: u64,
}

impl Progress {
    pub fn apply(&mut self, progress_type: ProgressType, count: u64) {
        let counter = match progress_type {
            ProgressType::Fetched => &mut self.fetched,
            ProgressType::Extracted => &mut self.extracted,
            ProgressType::CreatedContacts => &mut self.created_contacts,
            ProgressType::VerifiedContacts => &mut self.verified_contacts,
        };
        *counter = counter.saturating_add(count);
    }

    pub fn value(&self, counter: ProgressCounter) -> u64 {
        match counter {
            ProgressCounter::TotalMessages => self.total_messages,
            ProgressCounter::Fetched => self.fetched,
            ProgressCounter::Extracted => self.extracted,
            ProgressCounter::CreatedContacts => self.created_contacts,
            ProgressCounter::VerifiedContacts => self.verified_contacts,
        }
    }
}

/// Broker streams and consumer groups owned by one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStreams {
    pub messages_stream: String,
    pub messages_group: String,
    pub signatures_stream: String,
    pub signatures_group: String,
    pub emails_stream: String,
    pub emails_group: String,
}

impl TaskStreams {
    pub fn for_mining(mining_id: &str) -> Self {
        Self {
            messages_stream: format!("messages_stream-{}", mining_id),
            messages_group: format!("messages_consumer_group-{}", mining_id),
            signatures_stream: format!("signatures_stream-{}", mining_id),
            signatures_group: format!("signatures_consumer_group-{}", mining_id),
            emails_stream: format!("emails_stream-{}", mining_id),
            emails_group: format!("emails_verification_group-{}", mining_id),
        }
    }

    /// (stream, group) pairs consumed by a stage; torn down when it stops.
    pub fn consumed_by(&self, kind: StageKind) -> Vec<(&str, &str)> {
        match kind {
            StageKind::Fetch => vec![],
            StageKind::Extract => vec![
                (&self.messages_stream, &self.messages_group),
                (&self.signatures_stream, &self.signatures_group),
            ],
            StageKind::Clean => vec![(&self.emails_stream, &self.emails_group)],
        }
    }

    pub fn all(&self) -> Vec<(&str, &str)> {
        StageKind::ALL
            .iter()
            .flat_map(|kind| self.consumed_by(*kind))
            .collect()
    }
}

/// One end-to-end mining request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiningTask {
    pub task_id: String,
    pub user_id: String,
    pub stages: Stages,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
}

impl MiningTask {
    pub fn mining_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_canceled(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.status == StageStatus::Canceled)
    }
}

/// Persisted shape of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: StageKind,
    pub category: String,
    pub status: StageStatus,
    pub details: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
}

pub const MINING_CATEGORY: &str = "mining";

impl StageRecord {
    pub fn from_stage(user_id: &str, stage: &Stage) -> Self {
        Self {
            id: stage.id.clone(),
            user_id: user_id.to_string(),
            kind: stage.kind,
            category: MINING_CATEGORY.to_string(),
            status: stage.status,
            details: stage.details.clone(),
            started_at: stage.started_at,
            stopped_at: stage.stopped_at,
            duration: stage.duration,
        }
    }
}
