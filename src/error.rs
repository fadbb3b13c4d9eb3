// SPDX-License-Identifier: BUSL-1.1

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

/// Error codes surfaced at the HTTP/WebSocket-upgrade boundary.
///
/// Internal fallible paths (envelope serialization, channel parsing) don't
/// use this type — they're handled inline and never cross an HTTP
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutError {
    ServerShuttingDown,
    /// Per-IP or global connection-rate bucket rejected the handshake.
    TooManyConnections,
    /// Capacity semaphore, CPU, RSS, or live-task predicate rejected the
    /// handshake.
    ResourceExhausted,
}

impl FanoutError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ServerShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerShuttingDown => "SERVER_SHUTTING_DOWN",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::TooManyConnections => "TOO_MANY_CONNECTIONS",
        }
    }
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl IntoResponse for FanoutError {
    fn into_response(self) -> Response {
        let body =
            ErrorResponse { error: ErrorBody { code: self.as_str().to_owned(), message: self.to_string() } };
        (self.http_status(), Json(body)).into_response()
    }
}
