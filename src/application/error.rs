use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::infra::error::InfraError;

use super::repos::{BlobError, StoreError};
use super::upstream::UpstreamError;

/// Stable machine-readable error codes used in JSON error bodies.
pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_DATA: &str = "invalid_data";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UPSTREAM_UNREACHABLE: &str = "upstream_unreachable";
    pub const INTERNAL: &str = "internal";
}

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Registry-facing error body: `{"error": <code>, "reason": <text>}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("document not found")]
    NotFound,
    #[error("unable to parse response")]
    InvalidUpstreamPayload { status: StatusCode },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl RegistryError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound | RegistryError::Blob(BlobError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::InvalidUpstreamPayload { status } => *status,
            RegistryError::BadRequest(_) | RegistryError::Blob(BlobError::InvalidName(_)) => {
                StatusCode::BAD_REQUEST
            }
            RegistryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RegistryError::Store(_) | RegistryError::Blob(BlobError::Io(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NotFound | RegistryError::Blob(BlobError::NotFound(_)) => {
                codes::NOT_FOUND
            }
            RegistryError::InvalidUpstreamPayload { .. } => codes::INVALID_DATA,
            RegistryError::BadRequest(_) | RegistryError::Blob(BlobError::InvalidName(_)) => {
                codes::BAD_REQUEST
            }
            RegistryError::Upstream(_) => codes::UPSTREAM_UNREACHABLE,
            RegistryError::Store(_) | RegistryError::Blob(BlobError::Io(_)) => codes::INTERNAL,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let reason = match self {
            RegistryError::NotFound | RegistryError::Blob(BlobError::NotFound(_)) => {
                "document not found".to_string()
            }
            RegistryError::Store(_) | RegistryError::Blob(BlobError::Io(_)) => {
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            error: self.code(),
            reason,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let report = ErrorReport::from_error("application::error::RegistryError", status, &self);
        let mut response = (status, Json(self.body())).into_response();
        report.attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
