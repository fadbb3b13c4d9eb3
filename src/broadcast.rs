// SPDX-License-Identifier: BUSL-1.1

//! The Broadcast Engine: fans a single serialized envelope out to every
//! subscriber of a channel. This is the hot path — no locks are held
//! across the fan-out loop, and a slow or dead client never blocks
//! delivery to the rest.

use std::sync::Arc;

use crate::admission::DisconnectReason;
use crate::client::{Client, EnqueueOutcome};
use crate::envelope::{epoch_ms, serialize_once};
use crate::state::FanoutState;

/// Deliver one ingress record to every subscriber of `channel`.
///
/// Returns the number of clients the record was actually enqueued to, for
/// callers that want to log fan-out width. Evicts any client that crosses
/// its strike threshold during this fan-out; eviction happens after the
/// loop so the snapshot iteration never observes a mutated list.
pub fn publish(state: &FanoutState, channel: &str, event_type: &str, data: &serde_json::value::RawValue) -> usize {
    let Some(subscribers) = state.subscriptions().get(channel) else {
        return 0;
    };
    if subscribers.is_empty() {
        return 0;
    }

    let Some(payload) = serialize_once(event_type, data, epoch_ms()) else {
        tracing::warn!(channel, event_type, "envelope serialization failed, dropping record");
        return 0;
    };

    let mut delivered = 0usize;
    let mut to_evict: Vec<Arc<Client>> = Vec::new();

    for client in subscribers.iter() {
        match client.try_enqueue(payload.clone()) {
            EnqueueOutcome::Delivered => delivered += 1,
            EnqueueOutcome::Full => {
                if client.record_strike(state.config().slow_client_strikes) {
                    to_evict.push(client.clone());
                }
            }
            EnqueueOutcome::Closed => to_evict.push(client.clone()),
        }
    }

    for client in to_evict {
        client.request_close(DisconnectReason::SlowClientEvicted.close_code());
    }

    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use serde_json::value::RawValue;
    use tokio_util::sync::CancellationToken;

    async fn admitted_client(state: &FanoutState, id: &str) -> Arc<Client> {
        let permit = state.admission_semaphore().clone().try_acquire_owned().unwrap();
        let (client, _rx) = Client::new(
            id.to_owned(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            state.config(),
            permit,
        );
        state.registry().insert(client.clone());
        client
    }

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let state = FanoutState::new(FanoutConfig::default(), CancellationToken::new());
        let a = admitted_client(&state, "a").await;
        let b = admitted_client(&state, "b").await;
        state.subscriptions().add("trade.sol.usdc", a.clone());
        state.subscriptions().add("trade.sol.usdc", b.clone());

        let data = RawValue::from_string(r#"{"p":1}"#.to_owned()).unwrap();
        let delivered = publish(&state, "trade.sol.usdc", "trade", &data);
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn publish_on_unknown_channel_is_noop() {
        let state = FanoutState::new(FanoutConfig::default(), CancellationToken::new());
        let data = RawValue::from_string(r#"{}"#.to_owned()).unwrap();
        assert_eq!(publish(&state, "nobody.listens", "trade", &data), 0);
    }

    #[tokio::test]
    async fn full_queue_strikes_then_evicts() {
        let config = FanoutConfig { queue_capacity: 1, slow_client_strikes: 2, ..FanoutConfig::default() };
        let state = FanoutState::new(config, CancellationToken::new());
        let permit = state.admission_semaphore().clone().try_acquire_owned().unwrap();
        let (client, _rx) =
            Client::new("slow".to_owned(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), state.config(), permit);
        state.registry().insert(client.clone());
        state.subscriptions().add("c1", client.clone());

        let data = RawValue::from_string(r#"{}"#.to_owned()).unwrap();
        publish(&state, "c1", "trade", &data);
        assert!(!client.is_closed());
        publish(&state, "c1", "trade", &data);
        assert!(!client.is_closed());
        publish(&state, "c1", "trade", &data);
        assert!(client.is_closed());
        assert_eq!(client.take_pending_close(), Some(DisconnectReason::SlowClientEvicted.close_code()));
    }
}
