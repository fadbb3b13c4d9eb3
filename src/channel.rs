// SPDX-License-Identifier: BUSL-1.1

//! Channel derivation from ingress routing keys.
//!
//! A channel is the opaque `SYMBOL.EVENT` string used as the fan-out key.
//! Only equality is observed by the engine; nothing here interprets the
//! symbol or event name beyond recognizing the eight known event types for
//! envelope tagging.

/// The eight event types recognized in an ingress key's last segment.
pub const EVENT_TYPES: &[&str] =
    &["trade", "liquidity", "metadata", "social", "favorites", "creation", "analytics", "balances"];

/// Derive a channel (`SYMBOL.EVENT`) from an ingress key of shape
/// `odin.token.{SYMBOL}.{EVENT}`.
///
/// Requires at least four dot-segments; returns `None` for anything shorter,
/// which the caller treats as a dropped event.
pub fn derive_channel(ingress_key: &str) -> Option<String> {
    let segments: Vec<&str> = ingress_key.split('.').collect();
    if segments.len() < 4 {
        return None;
    }
    let symbol = segments[2];
    let event = segments[3];
    if symbol.is_empty() || event.is_empty() {
        return None;
    }
    Some(format!("{symbol}.{event}"))
}

/// Return the event-type segment of an ingress key, or `"unknown"` if the
/// key doesn't carry a recognized one. Used only to tag the envelope's
/// `type` field — routing itself only depends on the derived channel.
pub fn event_type_of(ingress_key: &str) -> &str {
    let segments: Vec<&str> = ingress_key.split('.').collect();
    match segments.get(3) {
        Some(event) if EVENT_TYPES.contains(event) => event,
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_symbol_event_channel() {
        assert_eq!(derive_channel("odin.token.BTC.trade").as_deref(), Some("BTC.trade"));
    }

    #[test]
    fn extra_segments_are_ignored() {
        assert_eq!(derive_channel("odin.token.BTC.trade.extra").as_deref(), Some("BTC.trade"));
    }

    #[test]
    fn fewer_than_four_segments_drops() {
        assert_eq!(derive_channel("odin.token.BTC"), None);
        assert_eq!(derive_channel(""), None);
        assert_eq!(derive_channel("a.b.c"), None);
    }

    #[test]
    fn empty_segment_drops() {
        assert_eq!(derive_channel("odin.token..trade"), None);
    }

    #[test]
    fn event_type_recognized() {
        assert_eq!(event_type_of("odin.token.BTC.trade"), "trade");
        assert_eq!(event_type_of("odin.token.BTC.bogus"), "unknown");
    }
}
