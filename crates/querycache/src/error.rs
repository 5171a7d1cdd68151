use std::io;
use std::sync::Arc;

use thiserror::Error;

/// An error produced while fetching a query, or while configuring one.
///
/// The same error value is handed to every caller that shared a deduplicated fetch, which is why
/// this type is [`Clone`]. Opaque producer errors are kept behind an [`Arc`] in
/// [`Other`](Self::Other).
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// A connectivity problem, like a refused or reset connection.
    #[error("network error: {0}")]
    Network(String),
    /// The producer gave up waiting on its transport.
    #[error("request timed out")]
    Timeout,
    /// A transient failure on the remote end, like a 5xx response.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// A permanent failure caused by the request itself, like a 4xx response.
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },
    /// The requested resource does not exist.
    #[error("not found")]
    NotFound,
    /// The payload did not match the expected shape.
    ///
    /// This points at a bug or a contract mismatch and is never retried.
    #[error("decoding failed: {0}")]
    Decoding(String),
    /// The fetch was cancelled before it settled.
    #[error("fetch cancelled")]
    Cancelled,
    /// The query is disabled and has no data to return.
    #[error("query is disabled")]
    Disabled,
    /// The query or its key was set up incorrectly.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Any other error returned by a producer.
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

impl QueryError {
    /// Whether a fetch failing with this error is worth retrying.
    ///
    /// Transient errors ([`Network`](Self::Network), [`Timeout`](Self::Timeout),
    /// [`Server`](Self::Server)) are retryable, as are unclassified errors. Errors that will not
    /// go away by asking again are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Server { .. } | Self::Other(_) => true,
            Self::Client { .. }
            | Self::NotFound
            | Self::Decoding(_)
            | Self::Cancelled
            | Self::Disabled
            | Self::InvalidConfiguration(_) => false,
        }
    }

    /// A short, stable name for this kind of error, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::NotFound => "not_found",
            Self::Decoding(_) => "decoding",
            Self::Cancelled => "cancelled",
            Self::Disabled => "disabled",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::Other(_) => "other",
        }
    }

    /// Classifies an opaque producer error.
    ///
    /// A [`QueryError`], [`serde_json::Error`] or [`io::Error`] anywhere in the chain decides the
    /// variant. Everything else is wrapped as [`Other`](Self::Other).
    pub fn classify(err: anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(err) = cause.downcast_ref::<QueryError>() {
                return err.clone();
            }
            if let Some(err) = cause.downcast_ref::<serde_json::Error>() {
                return Self::Decoding(err.to_string());
            }
            if let Some(err) = cause.downcast_ref::<io::Error>() {
                if let Some(classified) = Self::from_io_kind(err) {
                    return classified;
                }
            }
        }
        Self::Other(Arc::new(err))
    }

    fn from_io_kind(err: &io::Error) -> Option<Self> {
        use io::ErrorKind::*;
        match err.kind() {
            TimedOut => Some(Self::Timeout),
            NotFound => Some(Self::NotFound),
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | AddrNotAvailable | BrokenPipe | UnexpectedEof => {
                Some(Self::Network(err.to_string()))
            }
            InvalidData => Some(Self::Decoding(err.to_string())),
            _ => None,
        }
    }
}

impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Network(a), Self::Network(b)) => a == b,
            (Self::Timeout, Self::Timeout) => true,
            (
                Self::Server {
                    status: a,
                    message: m,
                },
                Self::Server {
                    status: b,
                    message: n,
                },
            ) => a == b && m == n,
            (
                Self::Client {
                    status: a,
                    message: m,
                },
                Self::Client {
                    status: b,
                    message: n,
                },
            ) => a == b && m == n,
            (Self::NotFound, Self::NotFound) => true,
            (Self::Decoding(a), Self::Decoding(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Disabled, Self::Disabled) => true,
            (Self::InvalidConfiguration(a), Self::InvalidConfiguration(b)) => a == b,
            // opaque errors are only equal to themselves
            (Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        Self::classify(err)
    }
}

impl From<io::Error> for QueryError {
    fn from(err: io::Error) -> Self {
        Self::from_io_kind(&err).unwrap_or_else(|| Self::Other(Arc::new(err.into())))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}
