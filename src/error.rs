use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use url::Url;

/// Result type for RustTPX operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RustTPX
///
/// Every failure that reaches a caller carries one of these kinds, so calling
/// code can pattern-match on it regardless of which engine produced it.
#[derive(Error, Debug)]
pub enum Error {
    /// Misuse of pipeline or feature registration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection establishment did not finish in time
    #[error("Connect timeout has expired [timeout={}ms]", .timeout.as_millis())]
    ConnectTimeout { timeout: Duration },

    /// No data was read from or written to an open connection in time
    #[error("Socket timeout has expired [timeout={}ms]", .timeout.as_millis())]
    SocketTimeout { timeout: Duration },

    /// The whole call did not finish in time
    #[error("Request timeout has expired [url={url}, timeout={}ms]", .timeout.as_millis())]
    RequestTimeout { url: String, timeout: Duration },

    /// Too many physical sends were performed for one logical call
    #[error("Max send count {max_send_count} exceeded")]
    SendCountExceeded { max_send_count: usize },

    /// Response rejected by the validation feature
    #[error(transparent)]
    ResponseStatus(#[from] ResponseStatusError),

    /// Operation attempted after the client or engine was closed
    #[error("Client engine is already closed")]
    EngineClosed,

    /// The call was cancelled before it finished
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// Transport failure reported by an engine
    #[error("Network error: {0}")]
    Network(String),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// I/O errors raised while producing or consuming a body
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid request configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Generic error with custom message
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a new connect timeout error
    pub fn connect_timeout(timeout: Duration) -> Self {
        Error::ConnectTimeout { timeout }
    }

    /// Create a new socket timeout error
    pub fn socket_timeout(timeout: Duration) -> Self {
        Error::SocketTimeout { timeout }
    }

    /// Create a new request timeout error
    pub fn request_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Error::RequestTimeout {
            url: url.into(),
            timeout,
        }
    }

    /// Create a new cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::Cancelled(message.into())
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network(message.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Create a new custom error
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(message.into())
    }

    /// Check if this is any of the three timeout kinds
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout { .. } | Error::SocketTimeout { .. } | Error::RequestTimeout { .. }
        )
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Check if this is a network error
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Check if the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Get the response status error if the validation feature rejected the response
    pub fn as_status_error(&self) -> Option<&ResponseStatusError> {
        match self {
            Error::ResponseStatus(e) => Some(e),
            _ => None,
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Error::InvalidRequest(format!("Invalid header name: {}", err))
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Error::InvalidRequest(format!("Invalid header value: {}", err))
    }
}

impl From<http::header::ToStrError> for Error {
    fn from(err: http::header::ToStrError) -> Self {
        Error::InvalidRequest(format!("Header value is not visible ASCII: {}", err))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// HTTP status code error raised by response validation
#[derive(Error, Debug)]
pub enum ResponseStatusError {
    /// Redirect that no installed feature followed (3xx status codes)
    #[error("Unhandled redirect: {url}. Status: {status}")]
    Redirect { status: StatusCode, url: Url, body: String },

    /// Client error (4xx status codes)
    #[error("Client request({url}) invalid: {status}")]
    Client { status: StatusCode, url: Url, body: String },

    /// Server error (5xx status codes)
    #[error("Server error({url}): {status}")]
    Server { status: StatusCode, url: Url, body: String },

    /// Unexpected status code
    #[error("Bad response({url}): {status}")]
    Unexpected { status: StatusCode, url: Url, body: String },
}

impl ResponseStatusError {
    /// Classify a status code by range
    pub fn from_status(status: StatusCode, url: Url, body: String) -> Self {
        match status.as_u16() {
            300..=399 => ResponseStatusError::Redirect { status, url, body },
            400..=499 => ResponseStatusError::Client { status, url, body },
            500..=599 => ResponseStatusError::Server { status, url, body },
            _ => ResponseStatusError::Unexpected { status, url, body },
        }
    }

    /// Get the status code
    pub fn status(&self) -> StatusCode {
        match self {
            ResponseStatusError::Redirect { status, .. }
            | ResponseStatusError::Client { status, .. }
            | ResponseStatusError::Server { status, .. }
            | ResponseStatusError::Unexpected { status, .. } => *status,
        }
    }

    /// Get the URL of the rejected request
    pub fn url(&self) -> &Url {
        match self {
            ResponseStatusError::Redirect { url, .. }
            | ResponseStatusError::Client { url, .. }
            | ResponseStatusError::Server { url, .. }
            | ResponseStatusError::Unexpected { url, .. } => url,
        }
    }

    /// Get the buffered response body
    pub fn body(&self) -> &str {
        match self {
            ResponseStatusError::Redirect { body, .. }
            | ResponseStatusError::Client { body, .. }
            | ResponseStatusError::Server { body, .. }
            | ResponseStatusError::Unexpected { body, .. } => body,
        }
    }

    /// Check if this is a redirect error
    pub fn is_redirect(&self) -> bool {
        matches!(self, ResponseStatusError::Redirect { .. })
    }

    /// Check if this is a client error
    pub fn is_client_error(&self) -> bool {
        matches!(self, ResponseStatusError::Client { .. })
    }

    /// Check if this is a server error
    pub fn is_server_error(&self) -> bool {
        matches!(self, ResponseStatusError::Server { .. })
    }
}
