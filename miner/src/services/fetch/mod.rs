//! Concurrent mailbox fetch engine

pub mod fetcher;
pub mod message;
pub mod queue;
pub mod service;
pub mod work_unit;

pub use fetcher::{EmailFetcher, FetchStatus};
pub use message::ParsedMessage;
pub use queue::WorkQueue;
pub use service::{FetchService, LocalFetchService};
pub use work_unit::{partition, SequenceRange, WorkUnit};
