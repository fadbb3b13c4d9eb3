// SPDX-License-Identifier: BUSL-1.1

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::FanoutState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    connections: usize,
}

/// Unauthenticated liveness/readiness probe. Reports `ok` even while
/// draining on shutdown — load balancers stop routing to the pod based on
/// the container's own termination signal, not this response.
pub async fn healthz(State(state): State<FanoutState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", connections: state.registry().len() })
}
