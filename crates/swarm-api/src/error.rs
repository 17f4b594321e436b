use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use swarm_core::CoreError;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid vehicle id {0:?}")]
    BadVehicleId(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadVehicleId(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                CoreError::EmptyPlan => StatusCode::BAD_REQUEST,
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::SequenceActive(_) => StatusCode::CONFLICT,
                CoreError::NoVehicles | CoreError::DiscoveryTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::Command { .. } | CoreError::Connection { .. } => StatusCode::BAD_GATEWAY,
                CoreError::NotReady(_) => StatusCode::GATEWAY_TIMEOUT,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), "request failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}
