//! The upstream authorization service boundary.
//!
//! The daemon never talks HTTP itself; it consumes an [`UpstreamClient`]
//! exposing the two authorize flavors and returning a structured
//! [`AuthResult`]. Client implementations are expected to request
//! hierarchy information with the call (the authorizer's limit propagation
//! depends on it) and to fold connection failures and upstream server
//! errors into [`UpstreamError::Unavailable`]; everything the upstream
//! answered deliberately (denials, missing applications, bad credentials)
//! comes back as a normal `AuthResult`.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::Credentials;

/// One usage counter of a metric as the upstream reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    /// The metric this counter belongs to.
    pub metric: String,
    /// Usage accumulated in the counter's current period.
    pub current_value: u64,
    /// The limit for the counter's period.
    pub max_value: u64,
}

impl UsageReport {
    /// Whether this counter still has headroom.
    #[must_use]
    pub fn within_limit(&self) -> bool {
        self.current_value < self.max_value
    }
}

/// The upstream's answer to one authorize call.
#[derive(Debug, Clone, Default)]
pub struct AuthResult {
    /// Whether the application is authorized.
    pub success: bool,
    /// Whether a failed authorization failed because of exhausted limits
    /// (as opposed to e.g. unknown credentials).
    pub limits_exceeded: bool,
    /// Upstream reason code for a failed authorization.
    pub error_code: Option<String>,
    /// Usage counters for every limited metric of the application.
    pub usage_reports: Vec<UsageReport>,
    /// Parent metric to children. Two levels at most: a metric with
    /// children is never itself a child. Empty for flat metric sets.
    pub hierarchy: HashMap<String, Vec<String>>,
}

impl AuthResult {
    /// An authorized result with the given counters and hierarchy.
    #[must_use]
    pub fn authorized(
        usage_reports: Vec<UsageReport>,
        hierarchy: HashMap<String, Vec<String>>,
    ) -> Self {
        Self { success: true, limits_exceeded: false, error_code: None, usage_reports, hierarchy }
    }

    /// A denial that is not about limits.
    #[must_use]
    pub fn denied(error_code: Option<String>) -> Self {
        Self { success: false, error_code, ..Self::default() }
    }

    /// A denial caused by exhausted limits, carrying the counters that
    /// show which metrics ran out.
    #[must_use]
    pub fn denied_over_limits(
        usage_reports: Vec<UsageReport>,
        hierarchy: HashMap<String, Vec<String>>,
    ) -> Self {
        Self { success: false, limits_exceeded: true, error_code: None, usage_reports, hierarchy }
    }
}

/// Error from an upstream call.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream could not be reached or answered with a server error.
    #[error("upstream unavailable: {message}")]
    Unavailable {
        /// What went wrong.
        message: String,
        /// The underlying transport error, when one is available.
        #[source]
        source: Option<flushd_kv::BoxError>,
    },
    /// Any other client-side failure (serialization, protocol violation).
    /// These propagate unwrapped: they are bugs, not weather.
    #[error("upstream client error: {message}")]
    Client {
        /// What went wrong.
        message: String,
        /// The underlying error, when one is available.
        #[source]
        source: Option<flushd_kv::BoxError>,
    },
}

impl UpstreamError {
    /// Creates an `Unavailable` error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into(), source: None }
    }

    /// Creates a `Client` error with the given message.
    #[must_use]
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client { message: message.into(), source: None }
    }
}

/// The upstream authorization service.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Authorizes an application identified by non-OAuth credentials.
    async fn authorize(
        &self,
        service_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthResult, UpstreamError>;

    /// Authorizes an application identified by an OAuth access token.
    async fn oauth_authorize(
        &self,
        service_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthResult, UpstreamError>;
}
