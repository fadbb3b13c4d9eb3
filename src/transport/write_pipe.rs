// SPDX-License-Identifier: BUSL-1.1

//! The Write Pipe: drains a client's outbound queue onto the socket,
//! ticks the protocol ping, and delivers out-of-band close frames even
//! when the data queue is fully saturated. On wakeup it writes the first
//! dequeued frame, then opportunistically drains whatever else is already
//! queued before a single flush, batching a burst into one write.

use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::DisconnectReason;
use crate::client::Client;
use crate::state::FanoutState;

pub async fn run(
    state: &FanoutState,
    client: Arc<Client>,
    mut rx: mpsc::Receiver<Arc<str>>,
    mut sink: SplitSink<axum::extract::ws::WebSocket, Message>,
    conn_token: CancellationToken,
) -> DisconnectReason {
    let write_deadline = state.config().write_deadline();
    let mut ping_timer = tokio::time::interval(state.config().ping_period());
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = client.close_notify.notified() => {
                if let Some(code) = client.take_pending_close() {
                    let _ = send_with_deadline(&mut sink, Message::Close(Some(close_frame(code))), write_deadline).await;
                    return reason_for_code(code);
                }
            }

            _ = conn_token.cancelled() => {
                let _ = send_with_deadline(
                    &mut sink,
                    Message::Close(Some(close_frame(DisconnectReason::ServerShutdown.close_code()))),
                    write_deadline,
                ).await;
                return DisconnectReason::ServerShutdown;
            }

            payload = rx.recv() => {
                match payload {
                    Some(payload) => {
                        if feed_with_deadline(&mut sink, Message::Text(payload.to_string().into()), write_deadline).await.is_err() {
                            return DisconnectReason::TransportError;
                        }
                        // Opportunistically drain whatever else is already queued
                        // so a burst of broadcasts costs one flush, not one per
                        // message.
                        while let Ok(more) = rx.try_recv() {
                            if feed_with_deadline(&mut sink, Message::Text(more.to_string().into()), write_deadline).await.is_err() {
                                return DisconnectReason::TransportError;
                            }
                        }
                        if flush_with_deadline(&mut sink, write_deadline).await.is_err() {
                            return DisconnectReason::TransportError;
                        }
                    }
                    None => return DisconnectReason::ClientClosed,
                }
            }

            _ = ping_timer.tick() => {
                if send_with_deadline(&mut sink, Message::Ping(Vec::new().into()), write_deadline).await.is_err() {
                    return DisconnectReason::TransportError;
                }
            }
        }
    }
}

/// Send one frame and flush immediately, for paths that can't batch (close,
/// ping).
async fn send_with_deadline(
    sink: &mut SplitSink<axum::extract::ws::WebSocket, Message>,
    message: Message,
    deadline: std::time::Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => Err(()),
    }
}

/// Buffer one frame without flushing, so a burst of outbound messages can
/// be written to the transport as a single syscall-flushing unit.
async fn feed_with_deadline(
    sink: &mut SplitSink<axum::extract::ws::WebSocket, Message>,
    message: Message,
    deadline: std::time::Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, sink.feed(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => Err(()),
    }
}

async fn flush_with_deadline(
    sink: &mut SplitSink<axum::extract::ws::WebSocket, Message>,
    deadline: std::time::Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, sink.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => Err(()),
    }
}

fn close_frame(code: u16) -> axum::extract::ws::CloseFrame {
    axum::extract::ws::CloseFrame { code, reason: "".into() }
}

fn reason_for_code(code: u16) -> DisconnectReason {
    match code {
        1008 => DisconnectReason::SlowClientEvicted,
        1001 => DisconnectReason::ServerShutdown,
        _ => DisconnectReason::ProtocolError,
    }
}
