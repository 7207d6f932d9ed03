use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::LedgerError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Request could not be decoded into the expected shape
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidOrder(_) => StatusCode::BAD_REQUEST,
                LedgerError::InsufficientFunds { .. } | LedgerError::InsufficientPosition { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::AccountExists(_) => StatusCode::CONFLICT,
                LedgerError::Conflict(_) | LedgerError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                LedgerError::CorruptValue { .. } | LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// Failures use the same envelope as successes: `{ "success": false, "message": ... }`.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            match &self {
                ApiError::Ledger(err) if err.is_retriable() => {
                    tracing::warn!(error = %err, "Transient ledger failure.");
                    format!("{}; retry with the same idempotency key", err)
                }
                _ => {
                    tracing::error!(error = ?self, "Ledger storage error.");
                    "An internal ledger error occurred".to_string()
                }
            }
        } else {
            self.to_string()
        };

        let body = Json(json!({ "success": false, "message": message }));
        (status, body).into_response()
    }
}
