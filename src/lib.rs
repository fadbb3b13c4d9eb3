// SPDX-License-Identifier: BUSL-1.1

pub mod admission;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ingress;
pub mod rate_limiter;
pub mod registry;
pub mod replay;
pub mod resource_guard;
pub mod state;
pub mod subscription;
pub mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

pub use config::FanoutConfig;
pub use state::FanoutState;

/// Start the fan-out server and run until `shutdown` is cancelled (or
/// Ctrl-C is received, for the top-level caller in `main`). Returns once
/// the listener has stopped accepting new connections and every admitted
/// client has either drained or been force-closed at the shutdown grace
/// deadline.
pub async fn run(config: FanoutConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let nats_url = config.nats_url.clone();
    let nats_subject = config.nats_subject.clone();

    let state = FanoutState::new(config, shutdown.clone());
    resource_guard::spawn_sampler(state.resource_guard().clone(), state.config(), shutdown.clone());

    if let Some(nats_url) = nats_url {
        let rx = ingress::connect_nats(&nats_url, nats_subject, shutdown.clone()).await?;
        let ingress_state = state.clone();
        let ingress_shutdown = shutdown.clone();
        tokio::spawn(async move { ingress::run(ingress_state, rx, ingress_shutdown).await });
    } else {
        tracing::warn!("no nats_url configured, ingress consumer is not running");
    }

    let router = transport::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "fan-out server listening");

    let grace_shutdown = shutdown.clone();
    let grace_state = state.clone();
    axum::serve(listener, transport::into_make_service(router))
        .with_graceful_shutdown(async move {
            grace_shutdown.cancelled().await;
            drain_with_grace(&grace_state).await;
        })
        .await?;

    Ok(())
}

/// Wait up to `shutdown_grace` for in-flight clients to drain on their
/// own (each connection's Write Pipe sees the cancelled token and sends a
/// close frame), then force-close whatever remains.
async fn drain_with_grace(state: &FanoutState) {
    let deadline = tokio::time::Instant::now() + state.config().shutdown_grace();
    while tokio::time::Instant::now() < deadline {
        if state.registry().is_empty() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    for client in state.registry().snapshot() {
        client.request_close(1001);
    }
}
