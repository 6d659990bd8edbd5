use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::docker::{CallError, ResultCode};
use crate::kv::KvError;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Service(#[from] CallError),

    #[error("KV store error: {0}")]
    Kv(#[from] KvError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ControlError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ControlError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ControlError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ControlError::Service(e) => {
                let status = match e.code {
                    ResultCode::Ok => StatusCode::OK,
                    ResultCode::NotModified => StatusCode::NOT_MODIFIED,
                    ResultCode::NotFound => StatusCode::NOT_FOUND,
                    ResultCode::Conflict => StatusCode::CONFLICT,
                    ResultCode::Offline | ResultCode::Timeout | ResultCode::Error => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ControlError::Kv(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ControlError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
