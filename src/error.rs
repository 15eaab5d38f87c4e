//! Contains the `Error` and `Result` types that `mysql-pool` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while acquiring, returning, or maintaining pooled
/// sessions. The inner [`ErrorKind`] is boxed to keep the type small on the
/// happy path.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn with_source(mut self, source: impl Into<Option<Error>>) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Constructs the error returned when a cancellation token fires.
    /// Intended for [`ServerSession`](crate::ServerSession) implementations
    /// that honor cancellation themselves.
    pub fn cancelled() -> Self {
        ErrorKind::Cancelled.into()
    }

    /// Constructs the "connect timeout" error returned when a checkout's
    /// cancellation fires while waiting for a pool permit.
    pub(crate) fn pool_exhausted(pool_name: &str) -> Self {
        ErrorKind::PoolExhausted {
            message: format!(
                "connect timeout: all sessions in pool `{}` are in use",
                pool_name
            ),
        }
        .into()
    }

    /// Constructs a session-establishment error. Intended for
    /// [`ServerSession`](crate::ServerSession) implementations.
    pub fn connect(message: impl Into<String>) -> Self {
        ErrorKind::Connect {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn redirection_required(cause: Option<Error>) -> Self {
        Error::new(ErrorKind::RedirectionRequired).with_source(cause)
    }

    #[cfg(feature = "dns-resolver")]
    pub(crate) fn from_resolve_error(error: hickory_resolver::error::ResolveError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }

    /// Whether this error was produced by honoring a cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Cancelled)
    }

    /// Whether this error indicates the pool's permit wait timed out.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolExhausted { .. })
    }

    /// Whether this error originated in session establishment.
    pub fn is_connect_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Connect { .. })
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(error)).into()
    }
}

impl From<std::io::ErrorKind> for Error {
    fn from(kind: std::io::ErrorKind) -> Self {
        ErrorKind::Io(Arc::new(kind.into())).into()
    }
}

/// The types of errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided, e.g. a malformed connection string.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A cancellation token fired before the operation completed.
    #[error("The operation was cancelled")]
    Cancelled,

    /// The cancellation token fired while waiting for a checkout permit;
    /// surfaced to callers as a connect timeout.
    #[error("{message}")]
    #[non_exhaustive]
    PoolExhausted { message: String },

    /// Establishing a new server session failed.
    #[error("Failed to connect: {message}")]
    #[non_exhaustive]
    Connect { message: String },

    /// Server redirection was required but did not occur.
    #[error("Server redirection was required but no redirect took place")]
    RedirectionRequired,

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A bug in this crate.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}
