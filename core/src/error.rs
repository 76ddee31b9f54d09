//! Error types for the Coze API client core.
//!
//! # Design
//! Every failure is raised as `Err(CozeError)`; nothing in the core hands an
//! error back as a successful value. The variants separate who is at fault:
//! the network (`Transport`), the server (`Api`, `OAuth`), the payload
//! (`Decode`), or the event stream framing (`Stream`). Server-side errors
//! always keep the HTTP status, the server message and the `x-tt-logid`
//! trace identifier.

use std::fmt;

use thiserror::Error;

/// Top-level error for every core operation.
#[derive(Debug, Error)]
pub enum CozeError {
    /// The server answered with a non-2xx status or a non-zero business code.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The authorization server answered with a known OAuth-flow error code.
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// The request never produced a complete response.
    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// A 2xx body that does not match the expected shape.
    #[error("decode error: {message}, logid: {logid}")]
    Decode { message: String, logid: String },

    /// Malformed event framing or a stream that ended without its terminator.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The request could not be built (serialization, unreadable upload, ...).
    #[error("invalid request: {0}")]
    Request(String),
}

impl CozeError {
    /// Trace identifier of the failed call, if the server issued one.
    pub fn logid(&self) -> Option<&str> {
        let logid = match self {
            CozeError::Api(e) => e.logid.as_str(),
            CozeError::OAuth(e) => e.logid.as_str(),
            CozeError::Decode { logid, .. } => logid.as_str(),
            CozeError::Stream(e) => e.logid(),
            CozeError::Transport { .. } | CozeError::Request(_) => return None,
        };
        (!logid.is_empty()).then_some(logid)
    }

    /// The OAuth-flow code, for callers that branch on pending/slow-down.
    pub fn oauth_code(&self) -> Option<OAuthErrorCode> {
        match self {
            CozeError::OAuth(e) => Some(e.code),
            _ => None,
        }
    }

    pub(crate) fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        CozeError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn decode(err: impl fmt::Display, logid: &str) -> Self {
        CozeError::Decode {
            message: err.to_string(),
            logid: logid.to_string(),
        }
    }
}

/// Error reported by the Coze API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ApiError {
    /// Business error code; `None` when the server did not send one.
    pub code: Option<i64>,
    pub msg: String,
    pub status: u16,
    pub logid: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code: {code}, msg: {}, logid: {}", self.msg, self.logid),
            None => write!(f, "msg: {}, logid: {}", self.msg, self.logid),
        }
    }
}

/// Error codes defined by the authorization server for device and PKCE flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthErrorCode {
    AuthorizationPending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
}

impl OAuthErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthErrorCode::AuthorizationPending => "authorization_pending",
            OAuthErrorCode::SlowDown => "slow_down",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::ExpiredToken => "expired_token",
        }
    }

    /// Recognize a wire code. Unknown codes stay generic API errors.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "authorization_pending" => Some(OAuthErrorCode::AuthorizationPending),
            "slow_down" => Some(OAuthErrorCode::SlowDown),
            "access_denied" => Some(OAuthErrorCode::AccessDenied),
            "expired_token" => Some(OAuthErrorCode::ExpiredToken),
            _ => None,
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth-flow failure carrying one of the [`OAuthErrorCode`]s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("oauth error: {code}, msg: {message}, logid: {logid}")]
pub struct OAuthError {
    pub code: OAuthErrorCode,
    pub message: String,
    pub status: u16,
    pub logid: String,
}

/// Which phase of the exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// DNS resolution or connection establishment, timeouts included.
    Connect,
    /// A configured timeout fired once the connection was up.
    Timeout,
    /// Read/write failure after the connection was up.
    Io,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Connect => f.write_str("connect"),
            TransportKind::Timeout => f.write_str("timeout"),
            TransportKind::Io => f.write_str("io"),
        }
    }
}

/// Event stream protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A frame that cannot be interpreted.
    #[error("{}", invalid_event_message(.field, .data, .logid))]
    InvalidEvent {
        field: String,
        data: String,
        logid: String,
    },

    /// The connection closed before the terminator frame.
    #[error("stream closed before terminator event, logid: {logid}")]
    UnexpectedEof { logid: String },
}

impl StreamError {
    pub fn logid(&self) -> &str {
        match self {
            StreamError::InvalidEvent { logid, .. } | StreamError::UnexpectedEof { logid } => logid,
        }
    }
}

fn invalid_event_message(field: &str, data: &str, logid: &str) -> String {
    if field.is_empty() {
        format!("invalid event, data: {data}, logid: {logid}")
    } else {
        format!("invalid event, field: {field}, data: {data}, logid: {logid}")
    }
}

impl From<ureq::Error> for CozeError {
    fn from(err: ureq::Error) -> Self {
        CozeError::transport(ureq_kind(&err), err.to_string())
    }
}

impl From<reqwest::Error> for CozeError {
    fn from(err: reqwest::Error) -> Self {
        // A connect timeout reports both; the phase wins.
        let kind = if err.is_connect() {
            TransportKind::Connect
        } else if err.is_timeout() {
            TransportKind::Timeout
        } else {
            TransportKind::Io
        };
        CozeError::transport(kind, err.to_string())
    }
}

impl From<std::io::Error> for CozeError {
    fn from(err: std::io::Error) -> Self {
        CozeError::transport(io_kind(&err), err.to_string())
    }
}

fn ureq_kind(err: &ureq::Error) -> TransportKind {
    match err {
        ureq::Error::Timeout(ureq::Timeout::Resolve | ureq::Timeout::Connect) => TransportKind::Connect,
        ureq::Error::Timeout(_) => TransportKind::Timeout,
        ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => TransportKind::Connect,
        ureq::Error::Io(e) => io_kind(e),
        _ => TransportKind::Io,
    }
}

/// `ureq` body readers wrap their own error in an `io::Error` of kind `Other`.
fn io_kind(err: &std::io::Error) -> TransportKind {
    use std::io::ErrorKind;

    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ureq::Error>()) {
        return ureq_kind(inner);
    }
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportKind::Timeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => TransportKind::Connect,
        _ => TransportKind::Io,
    }
}
