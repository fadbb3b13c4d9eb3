// SPDX-License-Identifier: BUSL-1.1

//! Reconnect replay: best-effort backfill of envelopes a client missed
//! while disconnected, bounded by a time budget and a record cap so a
//! slow or unbounded replay source can never stall a reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

/// One backfilled record from a replay source: the same `(topic,
/// partition, offset, key, payload)` shape the log broker itself streams,
/// so a real implementation can read straight off its own retained log.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    /// Raw JSON payload, not yet wrapped in an envelope.
    pub payload: Arc<str>,
}

/// A source of recently-published records, queried on reconnect. Given a
/// per-topic starting offset and a cap, returns a bounded batch; the
/// caller filters the result down to the client's current subscriptions
/// before delivery.
pub trait ReplayProvider: Send + Sync {
    /// Whether a real backing store is wired in. `NullReplayProvider`
    /// reports `false` so reconnect fails fast with `reconnect_error`
    /// instead of silently claiming zero messages replayed.
    fn is_configured(&self) -> bool {
        true
    }

    fn recent(&self, last_offset: &HashMap<String, i64>, max_records: usize) -> Vec<ReplayRecord>;
}

pub struct NullReplayProvider;

impl ReplayProvider for NullReplayProvider {
    fn is_configured(&self) -> bool {
        false
    }

    fn recent(&self, _last_offset: &HashMap<String, i64>, _max_records: usize) -> Vec<ReplayRecord> {
        Vec::new()
    }
}

/// Fixed-capacity in-memory ring per topic, used by tests and, optionally,
/// as a small best-effort replay buffer per deployment.
pub struct InMemoryReplayProvider {
    buffers: std::sync::Mutex<HashMap<String, Vec<ReplayRecord>>>,
    capacity: usize,
}

impl InMemoryReplayProvider {
    pub fn new(capacity: usize) -> Self {
        Self { buffers: std::sync::Mutex::new(HashMap::new()), capacity }
    }

    pub fn record(&self, topic: &str, partition: i32, offset: i64, key: &str, payload: Arc<str>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers.entry(topic.to_owned()).or_default();
        buffer.push(ReplayRecord { topic: topic.to_owned(), partition, offset, key: key.to_owned(), payload });
        if buffer.len() > self.capacity {
            let overflow = buffer.len() - self.capacity;
            buffer.drain(0..overflow);
        }
    }
}

impl ReplayProvider for InMemoryReplayProvider {
    fn recent(&self, last_offset: &HashMap<String, i64>, max_records: usize) -> Vec<ReplayRecord> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (topic, start_offset) in last_offset {
            let Some(buffer) = buffers.get(topic) else { continue };
            out.extend(buffer.iter().filter(|record| record.offset > *start_offset).cloned());
        }
        out.sort_by_key(|record| record.offset);
        out.truncate(max_records);
        out
    }
}

/// Run a replay lookup under the configured budget. Returns `None` on
/// timeout so the caller can distinguish "ran out of time" (a
/// `reconnect_error`) from "ran, found nothing" (a `reconnect_ack` with
/// `messages_replayed: 0`).
pub async fn replay_for_reconnect(
    provider: &dyn ReplayProvider,
    last_offset: &HashMap<String, i64>,
    max_records: usize,
    budget: Duration,
) -> Option<Vec<ReplayRecord>> {
    match timeout(budget, async { provider.recent(last_offset, max_records) }).await {
        Ok(records) => Some(records),
        Err(_) => {
            tracing::warn!("replay lookup exceeded budget, resuming from live data only");
            None
        }
    }
}
