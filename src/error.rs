use crate::protocol::ReplyCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for SOCKS5 session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a SOCKS5 session
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or truncated frame, wrong version byte, etc.
    /// Aborts the session; never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Negotiation found no overlap between the client's offered
    /// methods and the server's configured set
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Credential mismatch; the failure status byte has already
    /// been sent when this is raised
    #[error("authentication failed")]
    Auth,

    /// Dialing the destination failed; carries the reply-code
    /// classification sent back to the client
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// Transport error; during the relay phase there is no framing
    /// left to signal this on, so it is only logged
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// DialError classifies outbound connection failures onto the
/// SOCKS5 reply-code vocabulary
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused")]
    Refused,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("failed to resolve host '{0}'")]
    Resolution(String),

    #[error("connect failed: {0}")]
    Other(io::Error),
}

impl DialError {
    /// classify maps an i/o error from a connect attempt onto the
    /// nearest dial failure class
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => DialError::Refused,
            io::ErrorKind::HostUnreachable => DialError::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => DialError::NetworkUnreachable,
            io::ErrorKind::TimedOut => DialError::Timeout(Duration::ZERO),
            _ => DialError::Other(err),
        }
    }

    /// reply_code gives the SOCKS5 reply code sent to the client
    /// for this failure
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Timeout(_) => ReplyCode::TtlExpired,
            DialError::Refused => ReplyCode::ConnectionRefused,
            DialError::HostUnreachable => ReplyCode::HostUnreachable,
            DialError::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            DialError::Resolution(_) => ReplyCode::HostUnreachable,
            DialError::Other(_) => ReplyCode::ServerFailure,
        }
    }
}
