//! KV error types and result alias.
//!
//! Every backend maps its internal failures onto [`KvError`] so the layers
//! above (storage, renewer) can make retry and recovery decisions without
//! knowing which store is behind the trait.
//!
//! # Error Types
//!
//! - [`KvError::NotFound`] - the key does not exist where one was required
//!   (e.g. the source of a rename)
//! - [`KvError::Connection`] - network or connection-level failure
//! - [`KvError::Corrupt`] - a stored value violated an expected encoding
//!   (non-UTF-8 where text was required, non-integer under an increment)
//! - [`KvError::SubscriptionLagged`] - a subscriber fell behind the channel
//!   and messages were discarded
//! - [`KvError::Closed`] - the subscription or connection was closed
//! - [`KvError::Internal`] - backend-specific failures with no better home

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur during KV operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases; downstream match
/// expressions must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    /// The key was absent where the operation required it to exist.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// Connection or network error talking to the store.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<BoxError>,
    },

    /// A stored value violated the encoding the operation expected.
    #[error("corrupt value at {key}: {message}")]
    Corrupt {
        /// The key holding the offending value.
        key: String,
        /// What was expected and what was found.
        message: String,
    },

    /// The subscriber fell behind and the channel discarded messages.
    ///
    /// The subscription is still usable; `skipped` messages are gone.
    #[error("subscription lagged, {skipped} messages skipped")]
    SubscriptionLagged {
        /// How many messages were discarded.
        skipped: u64,
    },

    /// The channel or connection was closed underneath the caller.
    #[error("closed")]
    Closed,

    /// Backend-specific internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<BoxError>,
    },
}

impl KvError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Corrupt` error for the given key.
    #[must_use]
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt { key: key.into(), message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if this error is transient and the operation may
    /// succeed on retry.
    ///
    /// Only connection-level failures qualify. `NotFound`, `Corrupt`, and
    /// `Closed` are definitive: retrying the same operation cannot change
    /// the outcome.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
