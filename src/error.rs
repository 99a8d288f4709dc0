//! Error codes and JSON error responses for the router

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for router errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterErrorCode {
    /// Request path does not match any route
    InvalidPath,
    /// Repository is not present in the configuration
    UnknownRepository,
    /// Webhook payload failed signature validation
    InvalidSignature,
    /// Failed to connect to the application container
    UpstreamUnreachable,
    /// Internal router error
    InternalError,
}

impl RouterErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterErrorCode::InvalidPath => StatusCode::NOT_FOUND,
            RouterErrorCode::UnknownRepository => StatusCode::NOT_FOUND,
            RouterErrorCode::InvalidSignature => StatusCode::BAD_REQUEST,
            RouterErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            RouterErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Router-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RouterErrorCode::InvalidPath => "INVALID_PATH",
            RouterErrorCode::UnknownRepository => "UNKNOWN_REPOSITORY",
            RouterErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            RouterErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            RouterErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: RouterErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RouterErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Router-Error header
pub fn json_error_response(
    code: RouterErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Router-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
