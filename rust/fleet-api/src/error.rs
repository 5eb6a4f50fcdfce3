use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("Invalid sort field '{0}'")]
    InvalidSortField(String),

    #[error("Invalid limit value {0}")]
    InvalidLimit(i64),

    #[error("Invalid value '{value}' for filter '{field}'")]
    InvalidFilter { field: String, value: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("Internal Server Error")]
    StoreUnavailable(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidSortField(_)
            | ServiceError::InvalidLimit(_)
            | ServiceError::InvalidFilter { .. }
            | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Config(_) | ServiceError::StoreUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ServiceError::StoreUnavailable(source) => {
                error!(error = ?source, "store request failed");
                Some(format!("{source:#}"))
            }
            ServiceError::Config(detail) => {
                error!(%detail, "configuration error while serving request");
                None
            }
            _ => None,
        };

        let body = ErrorBody {
            error: self.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
