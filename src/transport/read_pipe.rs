// SPDX-License-Identifier: BUSL-1.1

//! The Read Pipe: the half of a connection that parses inbound control
//! messages and mutates the Subscription Index. Runs as its own task so a
//! client that stops reading (a full inbound TCP buffer, a hung peer)
//! never blocks delivery on the Write Pipe.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::admission::DisconnectReason;
use crate::channel::EVENT_TYPES;
use crate::client::{Client, EnqueueOutcome};
use crate::envelope::{epoch_ms, serialize_once};
use crate::replay::{replay_for_reconnect, ReplayProvider};
use crate::state::FanoutState;

#[derive(Debug, Deserialize)]
struct SubscribePayload {
    channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribePayload {
    channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReconnectPayload {
    client_id: String,
    last_offset: HashMap<String, i64>,
}

/// An inbound control frame, `{type, data}`. `type` drives the variant;
/// `data` carries its payload, absent for `heartbeat`.
#[derive(Debug)]
enum ControlMessage {
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    Heartbeat,
    Reconnect(ReconnectPayload),
}

fn parse_control_message(text: &str) -> Result<ControlMessage, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let msg_type = value.get("type").and_then(|v| v.as_str()).ok_or("missing \"type\"")?;
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);

    match msg_type {
        "subscribe" => serde_json::from_value(data).map(ControlMessage::Subscribe).map_err(|e| e.to_string()),
        "unsubscribe" => serde_json::from_value(data).map(ControlMessage::Unsubscribe).map_err(|e| e.to_string()),
        "heartbeat" => Ok(ControlMessage::Heartbeat),
        "reconnect" => serde_json::from_value(data).map(ControlMessage::Reconnect).map_err(|e| e.to_string()),
        other => Err(format!("unrecognized control message type {other:?}")),
    }
}

/// Drive the inbound half of a connection until the peer closes, the
/// rolling read deadline elapses, or `conn_token` is cancelled by the
/// Write Pipe. Returns the reason the loop exited.
pub async fn run(
    state: FanoutState,
    client: Arc<Client>,
    mut stream: SplitStream<axum::extract::ws::WebSocket>,
    replay: Arc<dyn ReplayProvider>,
    conn_token: CancellationToken,
) -> DisconnectReason {
    let pong_wait = state.config().pong_wait();

    loop {
        let message = tokio::select! {
            _ = conn_token.cancelled() => return DisconnectReason::ServerShutdown,
            received = tokio::time::timeout(pong_wait, stream.next()) => received,
        };

        let message = match message {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) => return DisconnectReason::TransportError,
            Ok(None) => return DisconnectReason::ClientClosed,
            Err(_) => return DisconnectReason::ReadTimeout,
        };

        match message {
            Message::Text(text) => {
                if !client.inbound_bucket.try_acquire() {
                    enqueue_reply(
                        &client,
                        serde_json::json!({
                            "type": "error",
                            "code": "RATE_LIMIT_EXCEEDED",
                            "message": "inbound message rate exceeded, frame dropped",
                        }),
                    );
                    continue;
                }
                handle_text(&state, &client, &replay, &text.to_string()).await;
            }
            Message::Binary(_) => continue,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return DisconnectReason::ClientClosed,
        }
    }
}

/// Best-effort enqueue of a server-originated control reply. Never blocks,
/// never disconnects the client on a full queue.
fn enqueue_reply(client: &Arc<Client>, reply: serde_json::Value) {
    let Ok(text) = serde_json::to_string(&reply) else { return };
    client.try_enqueue(Arc::from(text));
}

async fn handle_text(state: &FanoutState, client: &Arc<Client>, replay: &Arc<dyn ReplayProvider>, text: &str) {
    let control = match parse_control_message(text) {
        Ok(control) => control,
        Err(err) => {
            tracing::debug!(client_id = %client.id, error = %err, "dropping unparseable control message");
            return;
        }
    };

    match control {
        ControlMessage::Subscribe(payload) => {
            state.subscriptions().add_many(payload.channels.iter().map(String::as_str), client.clone());
            client.add_subscriptions(payload.channels.iter().cloned());
            enqueue_reply(
                client,
                serde_json::json!({
                    "type": "subscription_ack",
                    "subscribed": payload.channels,
                    "count": client.subscription_count(),
                }),
            );
        }
        ControlMessage::Unsubscribe(payload) => {
            state.subscriptions().remove_many(payload.channels.iter().map(String::as_str), client);
            client.remove_subscriptions(payload.channels.iter().map(String::as_str));
            enqueue_reply(
                client,
                serde_json::json!({
                    "type": "unsubscription_ack",
                    "unsubscribed": payload.channels,
                    "count": client.subscription_count(),
                }),
            );
        }
        ControlMessage::Heartbeat => {
            enqueue_reply(client, serde_json::json!({ "type": "pong", "ts": epoch_ms() }));
        }
        ControlMessage::Reconnect(payload) => {
            handle_reconnect(state, client, replay, payload).await;
        }
    }
}

async fn handle_reconnect(
    state: &FanoutState,
    client: &Arc<Client>,
    replay: &Arc<dyn ReplayProvider>,
    payload: ReconnectPayload,
) {
    if !replay.is_configured() {
        enqueue_reply(
            client,
            serde_json::json!({
                "type": "reconnect_error",
                "message": "no replay collaborator configured",
            }),
        );
        return;
    }

    let budget = state.config().replay_budget();
    let max_records = state.config().replay_max_records;
    let records = match replay_for_reconnect(replay.as_ref(), &payload.last_offset, max_records, budget).await {
        Some(records) => records,
        None => {
            enqueue_reply(
                client,
                serde_json::json!({
                    "type": "reconnect_error",
                    "message": "replay lookup exceeded budget",
                }),
            );
            return;
        }
    };

    let mut messages_replayed = 0usize;
    for record in records {
        if !client.is_subscribed(&record.topic) {
            continue;
        }
        let Ok(data) = RawValue::from_string(record.payload.to_string()) else { continue };
        let event_type = channel_event_type(&record.topic);
        let Some(envelope) = serialize_once(event_type, &data, epoch_ms()) else { continue };
        if client.try_enqueue(envelope) == EnqueueOutcome::Delivered {
            messages_replayed += 1;
        }
    }

    tracing::debug!(client_id = %payload.client_id, messages_replayed, "reconnect replay completed");
    enqueue_reply(
        client,
        serde_json::json!({
            "type": "reconnect_ack",
            "status": "completed",
            "messages_replayed": messages_replayed,
        }),
    );
}

/// A replay topic is a channel id (`SYMBOL.EVENT`); the event type is its
/// last dot-segment, same convention as ingress keys but without the
/// `odin.token.` prefix.
fn channel_event_type(topic: &str) -> &str {
    match topic.rsplit('.').next() {
        Some(event) if EVENT_TYPES.contains(&event) => event,
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_parses() {
        let msg = parse_control_message(r#"{"type":"subscribe","data":{"channels":["BTC.trade"]}}"#).unwrap();
        match msg {
            ControlMessage::Subscribe(payload) => assert_eq!(payload.channels, vec!["BTC.trade"]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unsubscribe_message_parses() {
        let msg = parse_control_message(r#"{"type":"unsubscribe","data":{"channels":["BTC.trade"]}}"#).unwrap();
        match msg {
            ControlMessage::Unsubscribe(payload) => assert_eq!(payload.channels, vec!["BTC.trade"]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn heartbeat_message_parses_without_data() {
        let msg = parse_control_message(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Heartbeat));
    }

    #[test]
    fn reconnect_message_parses_client_id_and_last_offset() {
        let msg = parse_control_message(
            r#"{"type":"reconnect","data":{"client_id":"d-1","last_offset":{"odin.trades":1000}}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::Reconnect(payload) => {
                assert_eq!(payload.client_id, "d-1");
                assert_eq!(payload.last_offset.get("odin.trades"), Some(&1000));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(parse_control_message(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn missing_type_fails_to_parse() {
        assert!(parse_control_message(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn channel_event_type_reads_last_segment() {
        assert_eq!(channel_event_type("BTC.trade"), "trade");
        assert_eq!(channel_event_type("BTC.bogus"), "unknown");
    }
}
