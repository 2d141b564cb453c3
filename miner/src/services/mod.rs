//! Mining services
//!
//! - `fetch/`: concurrent mailbox fetch engine and its control surface
//! - `tasks/`: task orchestrator, stage persistence and live progress
//! - `logger`: tracing setup shared by the binary and tests

pub mod fetch;
pub mod logger;
pub mod tasks;
