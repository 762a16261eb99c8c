use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{store::StoreError, transport::TransportFault};

/// Command-path errors surfaced at the API boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("instance has no live connection: {0}")]
    NotConnected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("instance is already connected: {0}")]
    AlreadyConnected(String),
    #[error("instance is logged out and must be re-provisioned: {0}")]
    TerminalDisconnect(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportFault),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("instance task is gone")]
    ChannelClosed,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: String,
}

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotConnected(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::AlreadyConnected(_) => StatusCode::CONFLICT,
            Self::TerminalDisconnect(_) => StatusCode::GONE,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) | Self::ChannelClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(ErrorEnvelope {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
