//! Operational error types for the daemon core.
//!
//! Parse failures live next to the types they guard
//! ([`CredentialsParseError`](crate::credentials::CredentialsParseError),
//! [`RequestParseError`](crate::request::RequestParseError),
//! [`KeyParseError`](crate::keys::KeyParseError)); this module holds the
//! errors that cross component boundaries at runtime.

use thiserror::Error;

use crate::credentials::Credentials;
use crate::upstream::UpstreamError;

/// Error returned when a configuration value fails validation.
///
/// Each variant names the field that was invalid and the constraint it
/// violated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A field that must be positive was zero.
    #[error("invalid {field}: must be positive (got {value})")]
    MustBePositive {
        /// The name of the configuration field.
        field: &'static str,
        /// A human-readable representation of the invalid value.
        value: String,
    },

    /// A relational constraint between two fields was violated.
    #[error("invalid config: {field_a} ({value_a}) must be <= {field_b} ({value_b})")]
    InvalidRelation {
        /// The field that should be the smaller value.
        field_a: &'static str,
        /// The actual value of field_a (human-readable).
        value_a: String,
        /// The field that should be the larger value.
        field_b: &'static str,
        /// The actual value of field_b (human-readable).
        value_b: String,
    },
}

/// Error computing authorizations for an application.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The upstream could not be reached. The renewal that triggered the
    /// call logs this and gives up; the next cache miss retries.
    #[error("upstream unavailable authorizing service {service_id}")]
    UpstreamUnavailable {
        /// The service the application belongs to.
        service_id: String,
        /// The application's credentials.
        credentials: Credentials,
        /// The transport failure.
        #[source]
        source: UpstreamError,
    },

    /// Any other upstream client failure, passed through unwrapped.
    #[error(transparent)]
    Upstream(UpstreamError),
}

/// Error writing an application's authorizations to the cache.
///
/// Partial writes are possible; the next renewal of the same application
/// overwrites the whole hash.
#[derive(Debug, Error)]
#[error("failed to write auth cache for service {service_id}")]
pub struct RenewAuthError {
    /// The service the application belongs to.
    pub service_id: String,
    /// The application's credentials.
    pub credentials: Credentials,
    /// The KV failure.
    #[source]
    pub source: flushd_kv::KvError,
}

/// Fatal error from the renewer's subscription loop.
///
/// The loop survives malformed messages and failing renewal tasks; only
/// the subscription primitive itself failing ends it. The process is
/// expected to restart.
#[derive(Debug, Error)]
pub enum RenewerError {
    /// Subscribing to the request channel failed, or the subscription
    /// died underneath the loop.
    #[error("request subscription failed")]
    Subscription(#[source] flushd_kv::KvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_name_the_field() {
        let err = ConfigError::MustBePositive { field: "auth_valid_secs", value: "0".into() };
        assert!(err.to_string().contains("auth_valid_secs"));

        let err = ConfigError::InvalidRelation {
            field_a: "workers.min",
            value_a: "8".into(),
            field_b: "workers.max",
            value_b: "4".into(),
        };
        assert!(err.to_string().contains("workers.min"));
        assert!(err.to_string().contains("workers.max"));
    }

    #[test]
    fn renew_auth_error_preserves_the_kv_source() {
        let err = RenewAuthError {
            service_id: "svc".into(),
            credentials: Credentials::from_user_key("uk"),
            source: flushd_kv::KvError::connection("down"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
