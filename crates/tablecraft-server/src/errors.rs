//! Request errors and their HTTP mapping

use std::fmt;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tablecraft_core::CoreError;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::response::Envelope;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedBody(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Core(e) => e.kind(),
            ApiError::MalformedBody(_) => "malformed_body",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ApiError::MalformedBody(_) => ErrorSeverity::Low,
            ApiError::Core(e) => match e {
                CoreError::SqlInjectionSuspected { .. } | CoreError::ForbiddenQuery(_) => ErrorSeverity::High,
                CoreError::PoolExhausted | CoreError::Timeout(_) => ErrorSeverity::Critical,
                CoreError::Database(_) | CoreError::Serialization(_) => ErrorSeverity::High,
                _ if e.is_client_error() => ErrorSeverity::Low,
                _ => ErrorSeverity::Medium,
            },
        }
    }

    /// Log at a level matching the severity
    pub fn log(&self, endpoint: &str) {
        let kind = self.kind();
        match self.severity() {
            ErrorSeverity::Low => info!(endpoint, kind, error = %self, "Request rejected"),
            ErrorSeverity::Medium => warn!(endpoint, kind, error = %self, "Request failed"),
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(endpoint, kind, severity = %self.severity(), error = %self, "Request failed")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(Envelope::failure(self.to_string()))).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}
