// SPDX-License-Identifier: BUSL-1.1

//! Connection admission and teardown. The WebSocket upgrade handler calls
//! `admit` before accepting the upgrade; every exit path from
//! `handle_connection` calls `teardown` exactly once.

use std::net::IpAddr;
use std::sync::Arc;

use crate::client::Client;
use crate::error::FanoutError;
use crate::state::FanoutState;

/// Why a connection was torn down. Logged at teardown, not surfaced to
/// the client beyond the close code already sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    SlowClientEvicted,
    ReadTimeout,
    ProtocolError,
    ServerShutdown,
    TransportError,
}

impl DisconnectReason {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::SlowClientEvicted => 1008,
            Self::ReadTimeout => 1001,
            Self::ProtocolError => 1002,
            Self::ServerShutdown => 1001,
            Self::TransportError => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SlowClientEvicted => "slow_client_evicted",
            Self::ReadTimeout => "read_timeout",
            Self::ProtocolError => "protocol_error",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError => "transport_error",
        }
    }
}

/// Admission checks, evaluated in order: shutdown gate, global connection
/// rate, per-IP connection rate, capacity semaphore, then the Resource
/// Guard's CPU/RSS/task predicates. Returns the semaphore permit to hold
/// for the life of the connection.
pub async fn admit(
    state: &FanoutState,
    remote_ip: IpAddr,
) -> Result<tokio::sync::OwnedSemaphorePermit, FanoutError> {
    if state.is_shutting_down() {
        return Err(FanoutError::ServerShuttingDown);
    }

    if let Some(bucket) = state.global_conn_bucket() {
        if !bucket.try_acquire() {
            return Err(FanoutError::TooManyConnections);
        }
    }

    if !state.per_ip_conn_buckets().try_acquire(remote_ip) {
        return Err(FanoutError::TooManyConnections);
    }

    let permit = state
        .admission_semaphore()
        .clone()
        .try_acquire_owned()
        .map_err(|_| FanoutError::ResourceExhausted)?;

    if let Err(err) = state.resource_guard().check_admission(state.registry().len()) {
        drop(permit);
        return Err(err);
    }

    Ok(permit)
}

/// Tear down a connection: release the admission permit, remove it from
/// the registry and every subscription, and return it to the pool.
/// Idempotent at the `Client` level via `mark_closed`, but callers must
/// still ensure this runs exactly once per connection to avoid
/// double-releasing the pool slot.
pub fn teardown(state: &FanoutState, client: Arc<Client>, reason: DisconnectReason) {
    client.mark_closed();
    client.release_permit();
    state.subscriptions().remove_client(&client);
    state.registry().remove(&client.id);
    state.resource_guard().note_connection_torn_down();
    tracing::info!(client_id = %client.id, reason = reason.as_str(), "connection closed");
    state.client_pool().release(client, state.config().max_connections.min(4096));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use std::net::Ipv4Addr;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn admits_within_capacity_and_rejects_when_shutting_down() {
        let config = FanoutConfig { max_connections: 2, ..FanoutConfig::default() };
        let token = CancellationToken::new();
        let state = FanoutState::new(config, token.clone());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let permit = admit(&state, ip).await;
        assert!(permit.is_ok());

        token.cancel();
        assert_eq!(admit(&state, ip).await.unwrap_err(), FanoutError::ServerShuttingDown);
    }

    #[tokio::test]
    async fn rejects_over_capacity() {
        let config = FanoutConfig {
            max_connections: 1,
            per_ip_conn_burst: 100,
            global_conn_per_sec: None,
            ..FanoutConfig::default()
        };
        let state = FanoutState::new(config, CancellationToken::new());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let _first = admit(&state, ip).await.expect("first admitted");
        assert_eq!(admit(&state, ip).await.unwrap_err(), FanoutError::ResourceExhausted);
    }
}
