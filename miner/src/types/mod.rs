//! Data structures shared across the provider, fetch engine and orchestrator

pub mod error;
pub mod mining;
pub mod records;

pub use error::{ErrorResponse, MinerError, NetworkErrorKind, Result};
pub use mining::{
    MiningTask, Progress, Stage, StageKind, StageRecord, StageStatus, Stages, TaskStreams,
};
pub use records::{
    EmailData, FetchStartRequest, FetchStartResponse, FetchStopRequest, HeaderMap, MessageRecord,
    ProgressCounter, ProgressEvent, ProgressType, RecordType, SignatureEmail, SignatureRecord,
    StreamCommand, StreamControl,
};
