//! JSON error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tfci::io::store::StoreError;
use tfci::scheduler::SchedulerError;
use tracing::error;

/// An error returned to HTTP clients as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::RunInProgress { .. } => {
                Self::new(StatusCode::CONFLICT, "RUN_IN_PROGRESS", message)
            }
            SchedulerError::NotFound(_) => Self::not_found(message),
            SchedulerError::NotCancellable(_) => {
                Self::new(StatusCode::CONFLICT, "RUN_NOT_CANCELLABLE", message)
            }
            SchedulerError::AlreadyFinished { .. } => {
                Self::new(StatusCode::CONFLICT, "RUN_FINISHED", message)
            }
            SchedulerError::ShuttingDown => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", message)
            }
            SchedulerError::Store(store) => store.into(),
            SchedulerError::Transition(_) | SchedulerError::Worker(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound(_) => Self::not_found(message),
            StoreError::Persistence(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE_UNAVAILABLE", message)
            }
            StoreError::Duplicate(_) | StoreError::IdChanged { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
