use std::time::Duration;

use thiserror::Error;

use crate::correlation::CorrelationId;
use crate::dtmi::DtmiValidationError;
use crate::retry::FailureKind;
use crate::token::TokenError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Transport level failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// Connect, read or write did not complete in time
    Timeout,
    /// The link was reset, refused or closed underneath us
    Reset,
    /// The peer sent something we could not understand
    Protocol,
    /// The operation has no mapping on this protocol
    Unsupported,
    /// TLS handshake or configuration failure
    Tls,
}

/// Errors surfaced by the client
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad or missing credentials or arguments, never retried
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Connect, send or receive failure
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        /// Failure category used for retry classification
        kind: TransportErrorKind,
        /// Description from the underlying library
        message: String,
    },
    /// The hub reported a failure
    #[error("service error {status}: {message}")]
    Service {
        /// HTTP status, or the equivalent status for MQTT/AMQP responses
        status: u16,
        /// Body or description returned by the service
        message: String,
        /// Service supplied retry hint
        retry_after: Option<Duration>,
    },
    /// A local deadline passed before the operation completed
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled by the caller or by `close()`
    #[error("operation cancelled")]
    Cancelled,
    /// The client is not open
    #[error("connection is closed")]
    ConnectionClosed,
    /// A correlation id was registered twice
    #[error("correlation id {0} is already registered")]
    DuplicateCorrelationId(CorrelationId),
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn transport(kind: TransportErrorKind, message: impl ToString) -> Self {
        Error::Transport {
            kind,
            message: message.to_string(),
        }
    }

    pub(crate) fn unsupported(message: impl ToString) -> Self {
        Self::transport(TransportErrorKind::Unsupported, message)
    }

    pub(crate) fn service(status: u16, message: impl Into<String>) -> Self {
        Error::Service {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify this error for the retry policy
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Configuration(_) => FailureKind::Configuration,
            Error::Transport { kind, .. } => match kind {
                TransportErrorKind::Timeout => FailureKind::NetworkTimeout,
                TransportErrorKind::Reset => FailureKind::TransportReset,
                TransportErrorKind::Protocol | TransportErrorKind::Unsupported => {
                    FailureKind::Malformed
                }
                TransportErrorKind::Tls => FailureKind::TransportReset,
            },
            Error::Service {
                status,
                retry_after,
                ..
            } => match status {
                401 | 403 => FailureKind::Unauthorized,
                429 | 503 => FailureKind::Throttled {
                    retry_after: *retry_after,
                },
                500..=599 => FailureKind::ServiceUnavailable,
                _ => FailureKind::Malformed,
            },
            Error::Timeout => FailureKind::Timeout,
            Error::Cancelled => FailureKind::Cancelled,
            Error::ConnectionClosed => FailureKind::Closed,
            Error::DuplicateCorrelationId(_) => FailureKind::Malformed,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => TransportErrorKind::Protocol,
            _ => TransportErrorKind::Reset,
        };
        Error::transport(kind, err)
    }
}

impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::transport(TransportErrorKind::Tls, err)
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<DtmiValidationError> for Error {
    fn from(err: DtmiValidationError) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::transport(TransportErrorKind::Timeout, "transport operation timed out")
    }
}
