use std::io;

use thiserror::Error;

/// Central error type for the kiln engine.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing. Surfaces as a 400 response.
    #[error("parse error: {0}")]
    Parse(#[from] HttpParseError),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A component was asked to do something its lifecycle state forbids.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Pipeline state-machine violation, e.g. committing a committed response.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Worker pool rejected a task (shutting down or saturated).
    #[error("task rejected: {0}")]
    Rejected(&'static str),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type KilnResult<T> = Result<T, KilnError>;

/// Taxonomy of request-parse failures. Each maps to HTTP 400 and the
/// connection is closed after the response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("invalid method: [{0}]")]
    InvalidMethod(String),

    #[error("invalid request target: [{0}]")]
    InvalidRequestTarget(String),

    #[error("invalid HTTP protocol: [{0}]")]
    InvalidProtocol(String),

    #[error("request line + headers exceed the configured header buffer size")]
    HeaderTooLarge,

    #[error("invalid header: [{0}]")]
    InvalidHeader(String),

    #[error("invalid chunked body encoding")]
    InvalidChunk,
}

/// Transport-level error recorded on a connection wrapper. Observed by the
/// protocol layer on its next read or write against the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Peer closed the connection.
    Eof,
    /// Read or write timed out (idle sweep or blocking I/O deadline).
    Timeout,
    /// TLS handshake could not complete.
    HandshakeFailed,
    /// Write failed mid-response.
    WriteFailed,
}

impl SocketError {
    pub fn as_io(self) -> io::Error {
        match self {
            SocketError::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
            SocketError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "socket timeout"),
            SocketError::HandshakeFailed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, "TLS handshake failed")
            }
            SocketError::WriteFailed => io::Error::new(io::ErrorKind::BrokenPipe, "write failed"),
        }
    }
}
