// SPDX-License-Identifier: BUSL-1.1

//! The WebSocket upgrade handler: admits the connection, splits the
//! socket into the Read Pipe and Write Pipe, and runs teardown exactly
//! once when either half exits.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::admission::{admit, teardown, DisconnectReason};
use crate::client::Client;
use crate::replay::{NullReplayProvider, ReplayProvider};
use crate::state::FanoutState;
use crate::transport::{read_pipe, write_pipe};

#[axum::debug_handler]
pub async fn ws_handler(
    State(state): State<FanoutState>,
    connect_info: Result<ConnectInfo<SocketAddr>, axum::extract::rejection::ExtensionRejection>,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Real deployments always run behind `into_make_service_with_connect_info`
    // (see `transport::into_make_service`), so `connect_info` is populated in
    // production; it's only absent under a test harness that doesn't carry a
    // real socket address.
    let addr = connect_info.ok().map(|ConnectInfo(addr)| addr).unwrap_or_else(|| {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
    });
    let permit = match admit(&state, addr.ip()).await {
        Ok(permit) => permit,
        Err(err) => return err.into_response(),
    };

    upgrade.on_upgrade(move |socket| async move {
        handle_connection(state, addr, socket, permit).await;
    })
}

async fn handle_connection(
    state: FanoutState,
    addr: SocketAddr,
    socket: WebSocket,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let id = uuid::Uuid::new_v4().to_string();
    let (client, outbound_rx) = match state.client_pool().acquire(id.clone(), addr.ip(), state.config(), permit) {
        Ok(pair) => pair,
        Err(permit) => Client::new(id.clone(), addr.ip(), state.config(), permit),
    };
    state.registry().insert(client.clone());
    state.resource_guard().note_connection_admitted();
    tracing::info!(client_id = %id, remote_ip = %addr.ip(), "connection admitted");

    let (sink, stream) = socket.split();
    // Per-connection only: coordinates Read Pipe / Write Pipe teardown on this
    // socket. Server-wide shutdown reaches a connection through
    // `drain_with_grace`'s `request_close`, not through this token, so
    // existing connections keep operating normally during the grace period.
    let conn_token = CancellationToken::new();
    let replay: Arc<dyn ReplayProvider> = Arc::new(NullReplayProvider);

    let write_token = conn_token.clone();
    let write_client = client.clone();
    let write_state = state.clone();
    let mut writer =
        tokio::spawn(async move { write_pipe::run(&write_state, write_client, outbound_rx, sink, write_token).await });

    let read_token = conn_token.clone();
    let read_client = client.clone();
    let read_state = state.clone();
    let mut reader = tokio::spawn(async move { read_pipe::run(read_state, read_client, stream, replay, read_token).await });

    let reason = tokio::select! {
        result = &mut writer => {
            conn_token.cancel();
            let _ = reader.await;
            result.unwrap_or(DisconnectReason::TransportError)
        }
        result = &mut reader => {
            conn_token.cancel();
            let _ = writer.await;
            result.unwrap_or(DisconnectReason::TransportError)
        }
    };

    teardown(&state, client, reason);
}
