pub mod manager;
pub mod sink;
pub mod store;

pub use manager::{uuid_ids, IdGenerator, MiningRequest, TasksManager};
pub use sink::{ChannelSink, LiveEvent, ProgressSink};
pub use store::TaskStore;
