//! Error types and handling for pagesync-core operations.
//!
//! Errors come in two layers:
//!
//! - [`FetchError`]: the outcome of exactly one page request. Produced by a
//!   [`PageFetcher`](crate::PageFetcher) and classified as transient or
//!   permanent so that the retry loop knows what to do with it.
//! - [`Error`]: the crate-wide error. Wraps fetch failures that survived the
//!   retry loop plus everything else (storage, configuration, cancellation).
//!
//! Operation-level outcomes such as partial failure or an exceeded deadline are
//! *not* errors: they are reported through [`SyncReport`](crate::SyncReport)
//! together with the records that were retrieved, so failed pages are never
//! dropped silently.
//!
//! ## Recovery Hints
//!
//! ```rust
//! use pagesync_core::{Error, FetchError};
//!
//! let transient = FetchError::Server { status: 503 };
//! assert!(transient.is_transient());
//!
//! let permanent = FetchError::Client { status: 400 };
//! assert!(!permanent.is_transient());
//!
//! let err = Error::RetryExhausted { attempts: 4, last: transient };
//! assert_eq!(err.category(), "retry_exhausted");
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

/// Failure of a single page request.
///
/// One `FetchError` corresponds to one network attempt. The retry policy
/// inspects [`FetchError::is_transient`] to decide whether another attempt is
/// worthwhile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused connection, reset, broken body).
    ///
    /// ## Recoverability
    ///
    /// Retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within its per-request timeout, or the
    /// server answered `408 Request Timeout`.
    ///
    /// ## Recoverability
    ///
    /// Retried with backoff.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The server answered with a 5xx status.
    ///
    /// ## Recoverability
    ///
    /// Retried with backoff.
    #[error("server error (HTTP {status})")]
    Server {
        /// HTTP status code.
        status: u16,
    },

    /// The server rejected the request with a 4xx status.
    ///
    /// A malformed filter or an unknown endpoint will not fix itself, so this
    /// is never retried.
    #[error("client error (HTTP {status})")]
    Client {
        /// HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded into a page.
    ///
    /// Treated as permanent: the same request is expected to produce the same
    /// body again.
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether another attempt at the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Server { .. }
        )
    }

    /// Short identifier used in logs and reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::Decode(_) => "decode",
        }
    }

    /// Map an HTTP status code onto the taxonomy.
    ///
    /// Returns `None` for success statuses.
    #[must_use]
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            408 => Some(Self::Timeout(format!("HTTP {status}"))),
            500..=599 => Some(Self::Server { status }),
            // Everything else outside 2xx (4xx, stray 1xx/3xx) is a request we
            // should not repeat.
            _ => Some(Self::Client { status }),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
                .unwrap_or_else(|| Self::Network(err.to_string()))
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// The main error type for pagesync-core operations.
///
/// All fallible public functions return `Result<T, Error>`.
#[derive(Error, Debug)]
pub enum Error {
    /// A page request failed permanently on its first attempt (a
    /// [`FetchError`] that is not transient).
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A transient failure persisted through the whole retry budget.
    ///
    /// Wraps the error of the final attempt.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of network attempts made, including the first.
        attempts: u32,
        /// Error returned by the final attempt.
        last: FetchError,
    },

    /// A stored checkpoint was produced by a different query shape.
    ///
    /// The facade reports this as a notice and restarts from offset 0; the
    /// [`Paginator`](crate::Paginator) returns it when asked to resume from an
    /// incompatible checkpoint.
    #[error(
        "checkpoint for '{job_key}' belongs to query {stored}, current query is {current}"
    )]
    CheckpointMismatch {
        /// Job key the checkpoint was stored under.
        job_key: String,
        /// Signature recorded in the checkpoint.
        stored: String,
        /// Signature of the query being run.
        current: String,
    },

    /// The query descriptor is invalid (bad endpoint, page size out of range).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint or cache storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration is invalid or inaccessible.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic error for uncategorized failures.
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Check if the error might be recoverable by running the operation again
    /// later.
    ///
    /// `RetryExhausted` is deliberately *not* recoverable here: the retry
    /// budget has already been spent. Callers that want another round should
    /// resume from a checkpoint.
    ///
    /// ```rust
    /// use pagesync_core::{Error, FetchError};
    ///
    /// assert!(Error::Fetch(FetchError::Timeout("slow".into())).is_recoverable());
    /// assert!(!Error::Fetch(FetchError::Client { status: 404 }).is_recoverable());
    /// assert!(!Error::Cancelled.is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_transient(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Get the error category as a string identifier.
    ///
    /// Useful for grouping failures in summaries and structured logs.
    ///
    /// - `"fetch"` - a page request failed permanently
    /// - `"retry_exhausted"` - transient failures outlasted the retry budget
    /// - `"checkpoint_mismatch"` - stored checkpoint belongs to another query
    /// - `"invalid_query"` - the query descriptor was rejected
    /// - `"io"`, `"storage"`, `"config"`, `"serialization"`
    /// - `"cancelled"` - cooperative cancellation
    /// - `"other"` - uncategorized
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::CheckpointMismatch { .. } => "checkpoint_mismatch",
            Self::InvalidQuery(_) => "invalid_query",
            Self::Io(_) => "io",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "other",
        }
    }

    /// The underlying fetch error, if this error came from the network layer.
    #[must_use]
    pub const fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) | Self::RetryExhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Whether this error means a page is permanently lost for this run
    /// (as opposed to the whole operation being interrupted).
    #[must_use]
    pub const fn is_page_failure(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::RetryExhausted { .. })
    }
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a single page request.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Timeout("slow".into()).is_transient());
        assert!(FetchError::Server { status: 502 }.is_transient());
        assert!(!FetchError::Client { status: 400 }.is_transient());
        assert!(!FetchError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(FetchError::from_status(200), None);
        assert_eq!(FetchError::from_status(204), None);
        assert_eq!(
            FetchError::from_status(400),
            Some(FetchError::Client { status: 400 })
        );
        assert_eq!(
            FetchError::from_status(404),
            Some(FetchError::Client { status: 404 })
        );
        assert_eq!(
            FetchError::from_status(503),
            Some(FetchError::Server { status: 503 })
        );
        assert!(matches!(
            FetchError::from_status(408),
            Some(FetchError::Timeout(_))
        ));
    }

    #[test]
    fn test_error_categories() {
        let cases = vec![
            (Error::Fetch(FetchError::Client { status: 400 }), "fetch"),
            (
                Error::RetryExhausted {
                    attempts: 4,
                    last: FetchError::Server { status: 500 },
                },
                "retry_exhausted",
            ),
            (
                Error::CheckpointMismatch {
                    job_key: "job".into(),
                    stored: "qs_a".into(),
                    current: "qs_b".into(),
                },
                "checkpoint_mismatch",
            ),
            (Error::InvalidQuery("x".into()), "invalid_query"),
            (Error::Io(io::Error::other("x")), "io"),
            (Error::Storage("x".into()), "storage"),
            (Error::Config("x".into()), "config"),
            (Error::Serialization("x".into()), "serialization"),
            (Error::Cancelled, "cancelled"),
            (Error::Other("x".into()), "other"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.category(), expected, "wrong category for {error:?}");
        }
    }

    #[test]
    fn test_recoverability() {
        assert!(Error::Fetch(FetchError::Server { status: 500 }).is_recoverable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "t")).is_recoverable());
        assert!(
            !Error::RetryExhausted {
                attempts: 4,
                last: FetchError::Server { status: 500 },
            }
            .is_recoverable()
        );
        assert!(!Error::Storage("disk".into()).is_recoverable());
    }

    #[test]
    fn test_fetch_error_accessor() {
        let err = Error::RetryExhausted {
            attempts: 3,
            last: FetchError::Timeout("t".into()),
        };
        assert!(matches!(err.fetch_error(), Some(FetchError::Timeout(_))));
        assert!(err.is_page_failure());
        assert!(Error::Cancelled.fetch_error().is_none());
        assert!(!Error::Cancelled.is_page_failure());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::RetryExhausted {
            attempts: 4,
            last: FetchError::Server { status: 503 },
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("503"));

        let err = Error::CheckpointMismatch {
            job_key: "orders".into(),
            stored: "qs_old".into(),
            current: "qs_new".into(),
        };
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
