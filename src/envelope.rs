// SPDX-License-Identifier: BUSL-1.1

//! The wire envelope broadcast to clients, and the serialize-once path.

use std::sync::Arc;

use serde::Serialize;
use serde_json::value::RawValue;

/// Priority assigned to an event type. Higher is more urgent; currently
/// advisory only (no queue reorders on priority, FIFO per client is
/// preserved).
pub fn priority_of(event_type: &str) -> i32 {
    match event_type {
        "trade" | "liquidity" => 10,
        "balances" => 8,
        "analytics" | "metadata" => 5,
        "social" | "favorites" | "creation" => 2,
        _ => 0,
    }
}

/// The server-framed wrapper around a raw event payload.
///
/// `seq` is reserved for a future shared sequence number: the current
/// engine always stamps `0` here to avoid per-client serialization. Tests
/// must not rely on `seq` uniqueness.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub seq: u64,
    pub ts: i64,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub priority: i32,
    pub data: &'a RawValue,
}

/// Build and serialize an envelope exactly once, returning a shared,
/// immutable buffer that every subscriber's enqueue attempt clones a
/// reference to.
///
/// Returns `None` on serialization failure — callers must drop the event
/// for every subscriber rather than deliver it partially.
pub fn serialize_once(event_type: &str, data: &RawValue, ts_ms: i64) -> Option<Arc<str>> {
    let envelope = Envelope { seq: 0, ts: ts_ms, event_type, priority: priority_of(event_type), data };
    serde_json::to_string(&envelope).ok().map(Arc::from)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_envelope_with_raw_data_passthrough() {
        let data = RawValue::from_string(r#"{"p":100}"#.to_owned()).unwrap();
        let out = serialize_once("trade", &data, 1_700_000_000_000).expect("serializes");
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["seq"], 0);
        assert_eq!(value["type"], "trade");
        assert_eq!(value["priority"], 10);
        assert_eq!(value["data"]["p"], 100);
    }

    #[test]
    fn priority_defaults_to_zero_for_unknown_type() {
        assert_eq!(priority_of("unknown"), 0);
    }
}
