//! Error types for the XenAPI NFS driver crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XenApiErrorKind {
    /// XAPI answered with `Status: Failure`
    Failure,
    /// Endpoint unreachable or HTTP exchange failed
    Transport,
    /// HTTP status other than 2xx
    Http(u16),
    /// Timeout
    Timeout,
    /// Malformed XML-RPC, or an XML-RPC `<fault>`
    Protocol,
    /// Result did not have the expected shape
    Decode,
    /// Invalid configuration
    Config,
    /// Local filesystem error
    Io,
}

/// The original `ErrorDescription` of a XAPI failure, e.g.
/// `["SESSION_INVALID", "OpaqueRef:…"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XenApiFailure {
    pub code: String,
    pub params: Vec<String>,
}

impl XenApiFailure {
    pub fn new(code: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            code: code.into(),
            params,
        }
    }

    /// Build from the raw `ErrorDescription` list.
    pub fn from_description(mut description: Vec<String>) -> Self {
        if description.is_empty() {
            return Self::new("UNKNOWN_FAILURE", Vec::new());
        }
        let code = description.remove(0);
        Self::new(code, description)
    }
}

impl fmt::Display for XenApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: [{}]", self.code, self.params.join(", "))
        }
    }
}

/// Crate error type carrying a kind, a human-readable message, and the
/// original remote failure when there was one.
#[derive(Debug, Clone)]
pub struct XenApiError {
    pub kind: XenApiErrorKind,
    pub message: String,
    pub failure: Option<XenApiFailure>,
}

impl XenApiError {
    pub fn new(kind: XenApiErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            failure: None,
        }
    }

    /// Wrap a remote failure returned by `method`.
    pub fn failure(method: &str, failure: XenApiFailure) -> Self {
        Self {
            kind: XenApiErrorKind::Failure,
            message: format!("{method} failed: {failure}"),
            failure: Some(failure),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Transport, msg)
    }

    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Http(status), msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Timeout, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Protocol, msg)
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Decode, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Config, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(XenApiErrorKind::Io, msg)
    }

    /// Remote error code, if this error wraps a XAPI failure.
    pub fn failure_code(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.code.as_str())
    }

    pub fn is_session_invalid(&self) -> bool {
        self.failure_code() == Some("SESSION_INVALID")
    }
}

impl fmt::Display for XenApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for XenApiError {}

impl From<XenApiError> for String {
    fn from(e: XenApiError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for XenApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::transport(format!("Connection failed: {e}"))
        } else {
            Self::transport(format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for XenApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::decode(format!("Unexpected result shape: {e}"))
    }
}

impl From<quick_xml::Error> for XenApiError {
    fn from(e: quick_xml::Error) -> Self {
        Self::protocol(format!("XML error: {e}"))
    }
}

impl From<std::io::Error> for XenApiError {
    fn from(e: std::io::Error) -> Self {
        Self::new(XenApiErrorKind::Io, format!("I/O error: {e}"))
    }
}

/// Convenience alias.
pub type XenApiResult<T> = Result<T, XenApiError>;
