// SPDX-License-Identifier: BUSL-1.1

pub mod http;
pub mod read_pipe;
pub mod ws;
pub mod write_pipe;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::FanoutState;

pub fn build_router(state: FanoutState) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn into_make_service(router: Router) -> axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr> {
    router.into_make_service_with_connect_info::<SocketAddr>()
}
