use std::fmt;
use std::io;

use thiserror::Error;

/// Errors returned by the driver surface (setup, submission, loop entry).
#[derive(Debug, Error)]
pub enum Error {
    /// Poller setup or operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A request was submitted without a host and no default host is set.
    #[error("request has no host")]
    NoHost,
    /// An https request was submitted but no TLS client configuration is set.
    #[error("https requested without a TLS client configuration")]
    TlsNotConfigured,
}

/// Stable error taxonomy recorded in a connection's error timeline and
/// delivered to the terminal callback.
///
/// Timeouts are split per deadline; [`ErrorKind::is_timeout`] collapses
/// them for callers that only care whether a deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Successful completion; the response is populated.
    NoError,
    /// TCP connect or DNS resolution failed.
    Connect,
    /// Reading the response failed.
    Read,
    /// Writing the request failed.
    Write,
    /// The request could not be constructed for the current attempt
    /// (bad host specification, empty host pool).
    Request,
    /// The response head could not be parsed.
    Response,
    /// The connect deadline fired.
    ConnectTimeout,
    /// The drain (request write) deadline fired.
    DrainTimeout,
    /// The end-to-end request deadline fired.
    RequestTimeout,
    /// TLS setup or handshake failed.
    Tls,
    /// A user hook failed.
    Internal,
    /// The response shape is unsupported (no Content-Length).
    Terminal,
    /// A retry was requested with no attempts remaining.
    RetryLimit,
}

impl ErrorKind {
    /// Whether this kind was synthesized by a firing deadline.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectTimeout | ErrorKind::DrainTimeout | ErrorKind::RequestTimeout
        )
    }

    /// Whether this kind reports a failure. `NoError` is the only kind
    /// that does not.
    pub fn is_error(self) -> bool {
        !matches!(self, ErrorKind::NoError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoError => "no_error",
            ErrorKind::Connect => "connect_error",
            ErrorKind::Read => "read_error",
            ErrorKind::Write => "write_error",
            ErrorKind::Request => "request_error",
            ErrorKind::Response => "response_error",
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::DrainTimeout => "drain_timeout",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::Tls => "tls_error",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Terminal => "terminal_error",
            ErrorKind::RetryLimit => "retry_limit",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
