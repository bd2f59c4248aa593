//! Error types for the cloud_drive crate.
//!
//! Every unexpected HTTP status is normalized into an [`ApiError`] by
//! [`normalize`]. Transport, decode and I/O failures keep their own variants.

use std::fmt;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Message the metadata service sends for missing nodes, sometimes without a code.
const NODE_DOES_NOT_EXIST: &str = "Node does not exists";

/// Default message for rate limited responses with an empty body.
const RATE_EXCEEDED: &str = "Rate exceeded";

/// Errors that can occur when interacting with the drive service.
#[derive(Error, Debug)]
pub enum CloudDriveError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Node {0} has no temporary link")]
    MissingTempLink(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

impl CloudDriveError {
    /// The structured error code, if this is a normalized API failure.
    pub fn api_code(&self) -> Option<&ErrorCode> {
        match self {
            CloudDriveError::Api(err) => Some(&err.code),
            _ => None,
        }
    }
}

impl From<InvalidStatus> for CloudDriveError {
    fn from(raw: InvalidStatus) -> Self {
        CloudDriveError::Api(normalize(raw))
    }
}

/// Result type alias for CloudDriveError.
pub type Result<T> = std::result::Result<T, CloudDriveError>;

/// Stable error codes reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NodeNotFound,
    ParentNotFound,
    NameAlreadyExists,
    TooManyRequests,
    CustomerNotFound,
    NoActiveSubscription,
    /// Synthesized when the body could not be read as a structured error.
    Unknown,
    /// The service sent an empty code.
    Unspecified,
    /// Any other code, kept verbatim.
    Other(String),
}

impl ErrorCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "NODE_NOT_FOUND" => ErrorCode::NodeNotFound,
            "PARENT_NODE_ID_NOT_FOUND" => ErrorCode::ParentNotFound,
            "NAME_ALREADY_EXISTS" => ErrorCode::NameAlreadyExists,
            "TOO_MANY_REQUESTS" => ErrorCode::TooManyRequests,
            "CUSTOMER_NOT_FOUND" => ErrorCode::CustomerNotFound,
            "NO_ACTIVE_SUBSCRIPTION_FOUND" => ErrorCode::NoActiveSubscription,
            "unknown" => ErrorCode::Unknown,
            "" => ErrorCode::Unspecified,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NodeNotFound => "NODE_NOT_FOUND",
            ErrorCode::ParentNotFound => "PARENT_NODE_ID_NOT_FOUND",
            ErrorCode::NameAlreadyExists => "NAME_ALREADY_EXISTS",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::CustomerNotFound => "CUSTOMER_NOT_FOUND",
            ErrorCode::NoActiveSubscription => "NO_ACTIVE_SUBSCRIPTION_FOUND",
            ErrorCode::Unknown => "unknown",
            ErrorCode::Unspecified => "",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response whose status was not one the request expected.
#[derive(Debug, Clone)]
pub struct InvalidStatus {
    pub expected: Vec<StatusCode>,
    pub got: StatusCode,
    pub content: String,
    pub headers: HeaderMap,
}

impl fmt::Display for InvalidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid response status! Got {}, expected {:?}; {}",
            self.got.as_u16(),
            self.expected.iter().map(|s| s.as_u16()).collect::<Vec<_>>(),
            self.content
        )
    }
}

/// Normalized failure reported by the service.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub logref: String,
    /// The raw response, absent for errors synthesized by the client.
    pub raw: Option<InvalidStatus>,
}

impl ApiError {
    pub(crate) fn synthesized(code: ErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            logref: String::new(),
            raw: None,
        }
    }

    /// HTTP status of the underlying response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.raw.as_ref().map(|raw| raw.got)
    }
}

/// Error body as sent by the service.
#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    logref: String,
}

fn is_error_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/vnd.error+json" || essence == "application/json"
}

/// Turn an unexpected-status response into a structured error.
pub fn normalize(raw: InvalidStatus) -> ApiError {
    let parsed = if is_error_json(&raw.headers) {
        serde_json::from_str::<WireError>(&raw.content).ok()
    } else {
        None
    };

    let wire = parsed.unwrap_or_else(|| WireError {
        code: "unknown".to_string(),
        message: raw.content.clone(),
        logref: String::new(),
    });

    let mut code = ErrorCode::from_wire(&wire.code);
    let mut message = wire.message;

    if raw.got == StatusCode::NOT_FOUND
        && code == ErrorCode::Unspecified
        && message == NODE_DOES_NOT_EXIST
    {
        code = ErrorCode::NodeNotFound;
    }

    if raw.got == StatusCode::TOO_MANY_REQUESTS {
        code = ErrorCode::TooManyRequests;
        if message.is_empty() {
            message = RATE_EXCEEDED.to_string();
        }
    }

    ApiError {
        code,
        message,
        logref: wire.logref,
        raw: Some(raw),
    }
}
