use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, StreamEntry, Subscription};
use crate::types::error::{MinerError, Result};

#[derive(Default)]
struct Stream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, usize>,
    last_millis: i64,
    seq: u64,
}

impl Stream {
    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis().max(self.last_millis);
        if now == self.last_millis {
            self.seq += 1;
        } else {
            self.last_millis = now;
            self.seq = 0;
        }
        format!("{}-{}", self.last_millis, self.seq)
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<String, Vec<flume::Sender<String>>>,
    streams: HashMap<String, Stream>,
}

/// Process-local broker. Channels fan out over `flume`; streams keep every
/// entry until deleted and track one cursor per consumer group.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every entry of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn has_stream(&self, stream: &str) -> bool {
        self.lock().streams.contains_key(stream)
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.groups.contains_key(group))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let mut state = self.lock();
        let Some(senders) = state.channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        Ok(senders.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = flume::unbounded();
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel = %channel, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.lock().channels.remove(channel);
        Ok(())
    }

    async fn append(&self, stream: &str, payload: String) -> Result<String> {
        let mut state = self.lock();
        let stream = state.streams.entry(stream.to_string()).or_default();
        let id = stream.next_id();
        stream.entries.push(StreamEntry {
            id: id.clone(),
            payload,
        });
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_insert(0);
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| MinerError::Broker(format!("no such stream {}", stream)))?;
        let cursor = *stream_state
            .groups
            .get(group)
            .ok_or_else(|| MinerError::Broker(format!("no group {} on {}", group, stream)))?;

        let end = (cursor + count).min(stream_state.entries.len());
        let batch = stream_state.entries[cursor..end].to_vec();
        stream_state.groups.insert(group.to_string(), end);
        Ok(batch)
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<()> {
        if let Some(stream) = self.lock().streams.get_mut(stream) {
            stream.groups.remove(group);
        }
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.lock().streams.remove(stream);
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize> {
        Ok(self
            .lock()
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0))
    }
}
