use http::StatusCode;
use thiserror::Error;

/// Rejections produced while parsing the client's request line and origin header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("method '{0}' is not supported")]
    MethodNotSupported(String),
    #[error("protocol version '{0}' is not supported")]
    VersionNotSupported(String),
    #[error("malformed request line '{0}'")]
    MalformedRequestLine(String),
    #[error("malformed origin header: {0}")]
    MalformedHeader(String),
    #[error("invalid request target '{0}'")]
    InvalidTarget(String),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::MethodNotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            RequestError::VersionNotSupported(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            RequestError::MalformedRequestLine(_)
            | RequestError::MalformedHeader(_)
            | RequestError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RequestError::MethodNotSupported(_) => "method_not_supported",
            RequestError::VersionNotSupported(_) => "version_not_supported",
            RequestError::MalformedRequestLine(_) => "malformed_request_line",
            RequestError::MalformedHeader(_) => "malformed_header",
            RequestError::InvalidTarget(_) => "invalid_target",
        }
    }
}

/// Failures of a single origin round trip. None of these are retried.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin {authority} unreachable: {source}")]
    Unreachable {
        authority: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out {0}")]
    Timeout(String),
    #[error("origin protocol error: {0}")]
    Protocol(String),
    #[error("origin response missing Content-Length for status {0}")]
    MissingContentLength(u16),
    #[error("origin body of {declared} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { declared: u64, limit: u64 },
    #[error("origin returned status {0}")]
    Status(u16),
    #[error("origin I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl OriginError {
    /// Client-visible status for this failure: origin 404s pass through, everything else is 502.
    pub fn status(&self) -> StatusCode {
        match self {
            OriginError::Status(404) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            OriginError::Unreachable { .. } => "origin_unreachable",
            OriginError::Timeout(_) => "origin_timeout",
            OriginError::Protocol(_) => "origin_protocol_error",
            OriginError::MissingContentLength(_) => "origin_missing_content_length",
            OriginError::BodyTooLarge { .. } => "origin_body_too_large",
            OriginError::Status(404) => "origin_not_found",
            OriginError::Status(_) => "origin_error_status",
            OriginError::Io(_) => "origin_io_error",
        }
    }
}

/// Failures while persisting an origin body into the cache.
#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("origin declared {declared} bytes but only {received} arrived")]
    ByteCountMismatch { declared: u64, received: u64 },
    #[error("timed out {0}")]
    Timeout(String),
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
