//! Error types for the dispatch layer.

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Low-level failure of a single HTTP exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The request did not complete within its timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other request error (bad URL, body decode, redirect loop...).
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportFailure {
    /// Whether the dispatcher may retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Errors that can occur while dispatching an outbound request.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Timeout or connection failure that outlived its retries.
    #[error("transport error: {0}")]
    Transport(#[from] TransportFailure),

    /// Upstream kept answering HTTP 429.
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Upstream kept serving a blocking page to a primary search request.
    #[error("blocked by upstream after {attempts} attempts")]
    Blocked { attempts: u32 },

    /// The anonymity circuit could not be validated or a challenge persisted.
    ///
    /// `disable` asks the session to stop using the anonymity network.
    #[error("anonymity network error: {message}")]
    Anonymity { message: String, disable: bool },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    pub(crate) fn anonymity(message: impl Into<String>, disable: bool) -> Self {
        Self::Anonymity {
            message: message.into(),
            disable,
        }
    }
}
