use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::db::duckdb_service;
use crate::hosts::HostError;
use crate::logs::LogSessionError;
use crate::scheduler::SchedulerError;
use crate::tasks::ManifestError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Upstream error: {0}")]
    Upstream(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::DatabaseError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Database error: {msg}"),
            ),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<ManifestError> for AppError {
    fn from(err: ManifestError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<duckdb_service::Error> for AppError {
    fn from(err: duckdb_service::Error) -> Self {
        match err {
            duckdb_service::Error::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::DatabaseError(other.to_string()),
        }
    }
}

impl From<HostError> for AppError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotFound(_) => AppError::NotFound(err.to_string()),
            HostError::Duplicate(_) => AppError::Conflict(err.to_string()),
            HostError::Invalid(_) => AppError::InvalidInput(err.to_string()),
            HostError::Vault(e) => AppError::InternalServerError(e.to_string()),
            HostError::Storage(e) => e.into(),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidCron(..) | SchedulerError::Invalid(_) => {
                AppError::InvalidInput(err.to_string())
            }
            SchedulerError::NotFound(_) => AppError::NotFound(err.to_string()),
            SchedulerError::Storage(e) => e.into(),
        }
    }
}

impl From<LogSessionError> for AppError {
    fn from(err: LogSessionError) -> Self {
        match err {
            LogSessionError::InvalidRequest(_) => AppError::InvalidInput(err.to_string()),
            LogSessionError::HostNotFound(_) | LogSessionError::NotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            LogSessionError::Transport(e) => AppError::Upstream(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON serialization/deserialization error: {err}"))
    }
}
