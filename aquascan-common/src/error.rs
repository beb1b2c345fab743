//! Common error types for AquaScan

use thiserror::Error;

/// Common result type for AquaScan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Local (non-network) error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure vocabulary of the detection service client
///
/// Every failed call to the service is classified into exactly one of these
/// variants. The set is closed: callers may match exhaustively.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// 400, and any other unclassified 4xx
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 401
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 403
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// 429
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// 5xx, or a 2xx envelope that reports `success: false`
    #[error("Server error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ServerError {
        /// HTTP status, when the failure came from a response status
        status: Option<u16>,
        /// Server-provided or fallback message
        message: String,
    },

    /// Response arrived but its body has no recognized shape
    #[error("Format error: {0}")]
    FormatError(String),

    /// No response: connect failure, timeout, broken stream
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The request could not be built locally
    #[error("Request setup error: {0}")]
    RequestSetupError(String),
}

impl ApiError {
    /// Classify a non-2xx response status
    ///
    /// `server_message` is the `error` field of the response body, when the
    /// body carried one.
    pub fn from_status(status: u16, server_message: Option<String>) -> Self {
        let message = server_message.unwrap_or_else(|| fallback_message(status));
        match status {
            400 => ApiError::BadRequest(message),
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited(message),
            400..=499 => ApiError::BadRequest(message),
            _ => ApiError::ServerError {
                status: Some(status),
                message,
            },
        }
    }

    /// Whether a caller that retries on a schedule should keep retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::ServerError { .. } | ApiError::NetworkUnreachable(_) | ApiError::RateLimited(_)
        )
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::ServerError { .. } => "server_error",
            ApiError::FormatError(_) => "format_error",
            ApiError::NetworkUnreachable(_) => "network_unreachable",
            ApiError::RequestSetupError(_) => "request_setup_error",
        }
    }

    /// Text shown to the user in a notification
    pub fn user_message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Unauthorized(_) => "Unauthorized access".to_string(),
            ApiError::Forbidden(_) => "Access forbidden".to_string(),
            ApiError::NotFound(_) => "Resource not found".to_string(),
            ApiError::RateLimited(_) => "Too many requests. Please try again later.".to_string(),
            ApiError::ServerError {
                status: Some(500), ..
            } => "Internal server error. Please try again.".to_string(),
            ApiError::ServerError { message, .. } => message.clone(),
            ApiError::FormatError(_) => "Unexpected data format received from server".to_string(),
            ApiError::NetworkUnreachable(_) => {
                "Cannot connect to server. Please check your connection.".to_string()
            }
            ApiError::RequestSetupError(_) => "Request failed. Please try again.".to_string(),
        }
    }
}

fn fallback_message(status: u16) -> String {
    match status {
        400 => "Bad request".to_string(),
        401 => "Unauthorized access".to_string(),
        403 => "Access forbidden".to_string(),
        404 => "Resource not found".to_string(),
        429 => "Too many requests".to_string(),
        _ => format!("Server error ({status})"),
    }
}
