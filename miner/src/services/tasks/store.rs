use crate::types::error::Result;
use crate::types::mining::StageRecord;

/// Durable storage for stage records.
pub trait TaskStore: Send + Sync {
    fn insert_stage(&self, record: &StageRecord) -> Result<()>;

    /// Persist status, stop time and duration of an existing stage.
    fn update_stage(&self, record: &StageRecord) -> Result<()>;

    fn get_stage(&self, id: &str) -> Result<Option<StageRecord>>;
}
