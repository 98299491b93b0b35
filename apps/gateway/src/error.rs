use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use wa_dispatch::DispatchError;

use crate::http::timestamp;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("WhatsApp client is not ready. Please initialize connection first.")]
    NotReady,
    #[error("WhatsApp session is not healthy. Please try again.")]
    Unhealthy,
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::NotReady => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unhealthy | ApiError::SendFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotReady => ApiError::NotReady,
            DispatchError::Unhealthy => ApiError::Unhealthy,
            DispatchError::Send(source) => ApiError::SendFailed(source.to_string()),
            DispatchError::InvalidRecipient(rejection) => {
                ApiError::BadRequest(format!("Invalid phone number format: {rejection}"))
            }
            other if other.is_client_error() => ApiError::BadRequest(other.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = Json(json!({
            "success": false,
            "message": self.to_string(),
            "timestamp": timestamp(),
        }));
        (status, body).into_response()
    }
}
