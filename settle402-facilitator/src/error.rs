//! HTTP error mapping for the facilitator service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use settle402::authorization::CodecError;
use settle402::chain::ChainError;

use crate::directory::DirectoryError;
use crate::engine::{SettleError, SettleStage};
use crate::monitor::MonitorError;

/// Errors returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The request is malformed.
    #[error("{0}")]
    BadRequest(String),
    /// Authorization building or wire parsing failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Directory operation failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Funding check failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    /// Settlement failed.
    #[error(transparent)]
    Settle(#[from] SettleError),
}

fn directory_status(error: &DirectoryError) -> StatusCode {
    match error {
        DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        DirectoryError::IdExhausted | DirectoryError::Crypto(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        DirectoryError::Store(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Status code for a settlement failure.
#[must_use]
pub const fn settle_status(error: &SettleError) -> StatusCode {
    match error {
        SettleError::FacilitatorNotFound(_) | SettleError::NoEligibleFacilitator(_) => {
            StatusCode::NOT_FOUND
        }
        SettleError::SettlementFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SettleError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SettleError::Transport { .. } | SettleError::Directory(_) => StatusCode::BAD_GATEWAY,
        SettleError::DecryptionFailed(_)
        | SettleError::InvalidSigningKey(_)
        | SettleError::ChainUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl ServiceError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Codec(_) => StatusCode::BAD_REQUEST,
            Self::Directory(e) | Self::Monitor(MonitorError::Directory(e)) => directory_status(e),
            Self::Monitor(MonitorError::UnknownNetwork(_)) => StatusCode::BAD_REQUEST,
            Self::Monitor(MonitorError::NoChain(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Monitor(MonitorError::Chain(ChainError::ConfirmationTimeout { .. })) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Monitor(MonitorError::Chain(_)) => StatusCode::BAD_GATEWAY,
            Self::Settle(e) => settle_status(e),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Request failed");
        }
        let (stage, disposition) = match &self {
            Self::Settle(e) => (Some(e.stage()), Some(e.disposition())),
            _ => (None::<SettleStage>, None),
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "stage": stage,
            "disposition": disposition,
        });
        (status, axum::Json(body)).into_response()
    }
}
