use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::engine::EngineError;
use crate::ledger::LedgerError;
use crate::responses::RequestMeta;
use crate::service::RewardsError;
use crate::withdraw::WithdrawalError;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_BELOW_MINIMUM: &str = "BELOW_MINIMUM";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_PAYMENT_METHOD: &str = "PAYMENT_METHOD";
pub const E_TASK_IN_PROGRESS: &str = "TASK_IN_PROGRESS";
pub const E_USER_NOT_FOUND: &str = "USER_NOT_FOUND";
pub const E_USER_CONFLICT: &str = "USER_CONFLICT";
pub const E_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const E_DB_FAILURE: &str = "DB_FAILURE";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Maps a domain error onto an HTTP error and its stable code.
pub trait IntoApiError {
    fn into_api_error(self) -> (ApiError, &'static str);
}

impl IntoApiError for WithdrawalError {
    fn into_api_error(self) -> (ApiError, &'static str) {
        let code = match self {
            WithdrawalError::InvalidAmount => E_BAD_AMOUNT,
            WithdrawalError::BelowMinimum => E_BELOW_MINIMUM,
            WithdrawalError::InsufficientBalance => E_INSUFFICIENT_BALANCE,
            WithdrawalError::MissingPaymentMethod | WithdrawalError::UnknownPaymentMethod(_) => {
                E_PAYMENT_METHOD
            }
        };
        (ApiError::BadRequest(self.to_string()), code)
    }
}

impl IntoApiError for LedgerError {
    fn into_api_error(self) -> (ApiError, &'static str) {
        match self {
            LedgerError::UserNotFound(_) => {
                (ApiError::NotFound(self.to_string()), E_USER_NOT_FOUND)
            }
            LedgerError::InsufficientBalance { .. } => (
                ApiError::BadRequest(WithdrawalError::InsufficientBalance.to_string()),
                E_INSUFFICIENT_BALANCE,
            ),
            LedgerError::Conflict(msg) => (ApiError::Conflict(msg), E_USER_CONFLICT),
            other => (ApiError::Internal(other.into()), E_DB_FAILURE),
        }
    }
}

impl IntoApiError for RewardsError {
    fn into_api_error(self) -> (ApiError, &'static str) {
        match self {
            RewardsError::Validation(e) => e.into_api_error(),
            RewardsError::Ledger(e) => e.into_api_error(),
        }
    }
}

impl IntoApiError for EngineError {
    fn into_api_error(self) -> (ApiError, &'static str) {
        match self {
            EngineError::AlreadyWatching => {
                (ApiError::Conflict(self.to_string()), E_TASK_IN_PROGRESS)
            }
            EngineError::SignedOut => (ApiError::Unauthorized(self.to_string()), E_UNAUTHORIZED),
        }
    }
}

/// Attaches request metadata and the matching error code to a domain error.
pub fn api_error<E: IntoApiError>(e: E, meta: &RequestMeta) -> ApiErrorWithMeta {
    let (error, code) = e.into_api_error();
    error.with_meta(meta.clone()).with_code(code)
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}
