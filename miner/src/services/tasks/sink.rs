use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

/// Receives live progress for one task (an SSE stream, a log, a test).
pub trait ProgressSink: Send + Sync {
    fn send(&self, event: &str, data: Value);

    /// No more events will follow.
    fn close(&self);
}

/// One live-update event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEvent {
    pub event: String,
    pub data: Value,
}

/// Sink backed by a `flume` channel; the receiver disconnects on close.
pub struct ChannelSink {
    tx: Mutex<Option<flume::Sender<LiveEvent>>>,
}

impl ChannelSink {
    pub fn channel() -> (Self, flume::Receiver<LiveEvent>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl ProgressSink for ChannelSink {
    fn send(&self, event: &str, data: Value) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            // A dropped receiver only means nobody is listening anymore
            let _ = tx.send(LiveEvent {
                event: event.to_string(),
                data,
            });
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
