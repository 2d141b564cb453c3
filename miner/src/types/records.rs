//! Wire records exchanged through the broker and the fetch control API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lowercased header name to every value it carried
pub type HeaderMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Email,
}

/// Payload of one fetched message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailData {
    pub header: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub seq_number: u32,
    pub folder_path: String,
    pub is_last: bool,
}

/// Entry appended to the messages stream for the extract stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub data: EmailData,
    pub user_id: String,
    pub user_email: String,
    pub user_identifier: String,
    pub mining_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEmail {
    pub message_id: String,
    pub from: Option<String>,
    pub date: Option<String>,
    pub body: String,
}

/// Entry appended to the signatures stream. The last entry of a job has
/// no email and `is_last` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub user_id: String,
    pub mining_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<SignatureEmail>,
    pub is_last: bool,
}

/// Counter kinds carried by progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressType {
    Fetched,
    Extracted,
    VerifiedContacts,
    CreatedContacts,
}

/// Counter names forwarded to live-update handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressCounter {
    TotalMessages,
    Fetched,
    Extracted,
    VerifiedContacts,
    CreatedContacts,
}

impl ProgressCounter {
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressCounter::TotalMessages => "totalMessages",
            ProgressCounter::Fetched => "fetched",
            ProgressCounter::Extracted => "extracted",
            ProgressCounter::VerifiedContacts => "verifiedContacts",
            ProgressCounter::CreatedContacts => "createdContacts",
        }
    }
}

impl From<ProgressType> for ProgressCounter {
    fn from(value: ProgressType) -> Self {
        match value {
            ProgressType::Fetched => ProgressCounter::Fetched,
            ProgressType::Extracted => ProgressCounter::Extracted,
            ProgressType::VerifiedContacts => ProgressCounter::VerifiedContacts,
            ProgressType::CreatedContacts => ProgressCounter::CreatedContacts,
        }
    }
}

/// Published on the channel named by the mining id. `count` is the delta
/// since the previous event of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub mining_id: String,
    pub progress_type: ProgressType,
    pub count: u64,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_canceled: bool,
}

pub const STREAM_CONTROL_CHANNEL: &str = "stream-management";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamCommand {
    Register,
    Delete,
}

/// Broadcast on [`STREAM_CONTROL_CHANNEL`] when a stream is created or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamControl {
    pub mining_id: String,
    pub command: StreamCommand,
    pub stream_name: String,
    pub consumer_group: String,
}

/// `POST start` body of the fetch service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStartRequest {
    pub user_id: String,
    pub mining_id: String,
    pub email: String,
    pub boxes: Vec<String>,
    pub extract_signatures: bool,
    pub contact_stream: String,
    pub signature_stream: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStartResponse {
    pub total_messages: u64,
}

/// `DELETE stop` body of the fetch service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStopRequest {
    pub mining_id: String,
    pub canceled: bool,
}
