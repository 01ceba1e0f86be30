//! Error types for the node exec agent

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the agent
#[derive(Debug, Error)]
pub enum Error {
    // Auth errors (2000-2999)
    #[error("no access token found")]
    NoAccessToken,

    #[error("create encrypt sig err")]
    CreateSignature,

    #[error("err in unmarshal the token: {0}")]
    MalformedToken(String),

    #[error("access token is expired")]
    TokenExpired,

    #[error("invalid user identity")]
    InvalidUser,

    // Request cache errors (3000-3999)
    #[error("too many in-flight requests, retry after {0}s")]
    TooManyInFlight(u64),

    #[error("token not found")]
    TokenNotFound,

    #[error("failed to generate unique token")]
    TokenGeneration,

    // Streaming errors (4000-4999)
    #[error("unable to upgrade: missing upgrade headers in request")]
    MissingUpgradeHeaders,

    #[error("unable to upgrade: unable to negotiate protocol: {0}")]
    ProtocolNegotiation(String),

    #[error("requested protocol(s) are not supported: {0}")]
    UnsupportedProtocol(String),

    #[error("timed out waiting for client to create streams")]
    StreamCreationTimeout,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    // Runtime errors (5000-5999)
    #[error("no containerId exist for podName={0}")]
    ContainerNotFound(String),

    #[error("error executing command in container: {0}")]
    ExecFailed(String),

    // Infrastructure errors (6000-6999)
    #[error("Docker error: {0}")]
    DockerError(String),

    // General errors (1000-1999)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Auth errors (2000-2999)
            Error::NoAccessToken => 2001,
            Error::CreateSignature => 2002,
            Error::MalformedToken(_) => 2003,
            Error::TokenExpired => 2004,
            Error::InvalidUser => 2005,

            // Request cache errors (3000-3999)
            Error::TooManyInFlight(_) => 3001,
            Error::TokenNotFound => 3002,
            Error::TokenGeneration => 3003,

            // Streaming errors (4000-4999)
            Error::MissingUpgradeHeaders => 4001,
            Error::ProtocolNegotiation(_) => 4002,
            Error::UnsupportedProtocol(_) => 4003,
            Error::StreamCreationTimeout => 4004,
            Error::Stream(_) => 4005,
            Error::Protocol(_) => 4006,

            // Runtime errors (5000-5999)
            Error::ContainerNotFound(_) => 5001,
            Error::ExecFailed(_) => 5002,

            // Infrastructure errors (6000-6999)
            Error::DockerError(_) => 6001,

            // General errors (1000-1999)
            Error::InvalidRequest(_) => 1001,
            Error::InvalidParameter(_) => 1002,
            Error::Internal(_) => 1003,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NoAccessToken
            | Error::MalformedToken(_)
            | Error::TokenExpired
            | Error::InvalidUser => StatusCode::UNAUTHORIZED,

            Error::TooManyInFlight(_) => StatusCode::TOO_MANY_REQUESTS,

            Error::TokenNotFound | Error::ContainerNotFound(_) => StatusCode::NOT_FOUND,

            Error::ProtocolNegotiation(_) | Error::UnsupportedProtocol(_) => StatusCode::FORBIDDEN,

            Error::MissingUpgradeHeaders
            | Error::InvalidRequest(_)
            | Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,

            Error::StreamCreationTimeout => StatusCode::GATEWAY_TIMEOUT,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            Error::TooManyInFlight(secs) => Some(*secs),
            _ => None,
        };
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details: None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::DockerError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}
