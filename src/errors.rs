//! Wire-level error envelope and the config-time error taxonomy.
//!
//! The Anthropic wire envelope is `{ "type": "error", "error": { "type", "message" } }`.
//! `ApiError` is the in-process representation; `IntoResponse` renders it onto the wire
//! with the matching HTTP status code per spec §7.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors surfaced to the client through the `/v1/messages` envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Overloaded(String),

    #[error("{0}")]
    Api(String),

    #[error("{0}")]
    Authentication(String),
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded(message.into())
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    fn wire_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Overloaded(_) => "overloaded_error",
            Self::Api(_) => "api_error",
            Self::Authentication(_) => "authentication_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::InvalidRequest(m) | Self::Overloaded(m) | Self::Api(m) | Self::Authentication(m) => m,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    error: ErrorDetail,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.wire_type(), message = self.message(), "request failed");
        let body = ErrorEnvelope {
            kind: "error",
            error: ErrorDetail { kind: self.wire_type(), message: self.message().to_string() },
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Config-time errors (not part of the wire protocol) — raised while
/// loading and validating `Config`, before the server ever binds a port.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ConfigError {
    pub code: &'static str,
    pub message: String,
    pub context: Option<String>,
}

impl ConfigError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), context: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new("FILE_NOT_FOUND", format!("config file not found: {path}")).with_context(path)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new("PARSE_ERROR", message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new("INVALID_CONFIG", message)
    }

    pub fn missing_nodes() -> Self {
        Self::new("MISSING_NODES", "static discovery requires at least one node")
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new("INVALID_URL", format!("invalid node URL: {url}")).with_context(url)
    }

    pub fn invalid_strategy(strategy: impl Into<String>) -> Self {
        let strategy = strategy.into();
        Self::new("INVALID_STRATEGY", format!("unknown routing strategy: {strategy}"))
            .with_context(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_matches_taxonomy() {
        assert_eq!(ApiError::invalid_request("x").wire_type(), "invalid_request_error");
        assert_eq!(ApiError::overloaded("x").wire_type(), "overloaded_error");
        assert_eq!(ApiError::api("x").wire_type(), "api_error");
        assert_eq!(ApiError::authentication("x").wire_type(), "authentication_error");
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ApiError::invalid_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::overloaded("x").status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::api("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::authentication("x").status(), StatusCode::UNAUTHORIZED);
    }
}
