// SPDX-License-Identifier: BUSL-1.1

use axum_test::TestServer;
use odin_fanout::config::FanoutConfig;
use odin_fanout::state::FanoutState;
use odin_fanout::transport::build_router;
use tokio_util::sync::CancellationToken;

fn test_server(config: FanoutConfig) -> (TestServer, FanoutState) {
    let state = FanoutState::new(config, CancellationToken::new());
    let router = build_router(state.clone());
    let server = TestServer::new(router).expect("create test server");
    (server, state)
}

/// Minimal valid WebSocket upgrade handshake headers, just enough for
/// axum's `WebSocketUpgrade` extractor to accept the request and run the
/// handler body, where admission is decided.
fn with_upgrade_headers(request: axum_test::TestRequest) -> axum_test::TestRequest {
    request
        .add_header("connection", "Upgrade")
        .add_header("upgrade", "websocket")
        .add_header("sec-websocket-version", "13")
        .add_header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
}

#[tokio::test]
async fn healthz_reports_ok_and_connection_count() {
    let (server, _state) = test_server(FanoutConfig::default());
    let response = server.get("/healthz").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn ws_upgrade_rejected_when_shutting_down() {
    let shutdown = CancellationToken::new();
    let state = FanoutState::new(FanoutConfig::default(), shutdown.clone());
    let router = build_router(state);
    let server = TestServer::new(router).expect("create test server");

    shutdown.cancel();
    let response = with_upgrade_headers(server.get("/ws")).await;
    response.assert_status_service_unavailable();
}

#[tokio::test]
async fn ws_upgrade_rejected_over_capacity() {
    let config = FanoutConfig { max_connections: 0, ..FanoutConfig::default() };
    let (server, _state) = test_server(config);
    let response = with_upgrade_headers(server.get("/ws")).await;
    response.assert_status_service_unavailable();
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (server, _state) = test_server(FanoutConfig::default());
    let response = server.get("/does-not-exist").await;
    response.assert_status_not_found();
}
