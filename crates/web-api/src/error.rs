use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        let status = match &error {
            ApplicationError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ApplicationError::Authorization { .. } => StatusCode::FORBIDDEN,
            ApplicationError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApplicationError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApplicationError::Store(domain::RepositoryError::Conflict) => StatusCode::CONFLICT,
            ApplicationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApplicationError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApplicationError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
        ApiError::new(status, error.code(), error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
