//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::HubError;

/// A hub error on its way to an HTTP client.
#[derive(Debug)]
pub enum ApiError {
    Hub(HubError),
    BadRequest(String),
}

impl From<HubError> for ApiError {
    fn from(error: HubError) -> Self {
        Self::Hub(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Hub(error) => match error {
                HubError::NotFound { .. } => StatusCode::NOT_FOUND,
                HubError::SchemaValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                HubError::Connection { .. }
                | HubError::ToolExecution { .. }
                | HubError::ServerRequest { .. }
                | HubError::Model(_) => StatusCode::BAD_GATEWAY,
                HubError::Configuration(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> String {
        match self {
            Self::BadRequest(_) => "invalid_request".to_string(),
            Self::Hub(error) => error.category().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match self {
            Self::Hub(error) => error.to_string(),
            Self::BadRequest(message) => message,
        };

        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": kind,
            }
        });

        (status, Json(body)).into_response()
    }
}
