use hyper::StatusCode;
use thiserror::Error;

/// Sub-classification of authentication failures so callers can pick a
/// different mode and retry themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The server rejected the supplied credentials.
    BadCredentials,
    /// The server only offers an authentication scheme this connection was
    /// not configured for (e.g. it demands challenge-response while we carry
    /// Basic credentials, or vice versa).
    WrongMode,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Network / transport failure. Never retried automatically.
    #[error("transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed: {0:?}")]
    Auth(AuthFailure),

    /// A 3xx the engine does not follow on its own; the caller owns the
    /// decision whether its cached mapping for the resource is stale.
    #[error("server redirected to {location:?}")]
    Redirected { location: Option<String> },

    /// Protocol-level failure reported as an HTTP status (404, 405, 412,
    /// 5xx, ...). Partial bulk failures are *not* reported here; those stay
    /// per-item in the multistatus results.
    #[error("request failed with status {0}")]
    Status(StatusCode),

    #[error("malformed multistatus response: {0}")]
    Decode(String),

    #[error("invalid uri: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),

    #[error("invalid uri: {0}")]
    UriParts(#[from] hyper::http::uri::InvalidUriParts),

    #[error("invalid header value: {0}")]
    Header(#[from] hyper::header::InvalidHeaderValue),

    #[error("invalid method: {0}")]
    Method(#[from] hyper::http::method::InvalidMethod),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success status to the matching error variant. 3xx becomes
    /// [`Error::Redirected`], 401 an auth failure, anything else a plain
    /// status error.
    pub fn from_status(status: StatusCode, location: Option<String>) -> Self {
        if status.is_redirection() {
            Error::Redirected { location }
        } else if status == StatusCode::UNAUTHORIZED {
            Error::Auth(AuthFailure::BadCredentials)
        } else {
            Error::Status(status)
        }
    }
}
