//! KV key and channel naming.
//!
//! Every key and channel name the daemon touches is derived here, from the
//! application identity (service id + credentials) and, for flush state,
//! a per-cycle suffix. Names are stable across restarts and parse back
//! uniquely: the credentials component is the canonical escaped form, so
//! the `:` delimiters of the grammar stay unambiguous.
//!
//! # Name grammar
//!
//! | Name | Shape |
//! |------|-------|
//! | auth cache hash | `auth:<service>:<creds>` |
//! | report counter hash | `report:<service>:<creds>` |
//! | cached-report membership set | `report_keys` |
//! | flushing membership set | `flushing_report_keys<suffix>` |
//! | renamed report hash | `to_flush:report:<service>:<creds><suffix>` |
//! | request channel | `auth_requests` |
//! | response channel | `auth_response:<service>:<creds>:<metric>` |

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use thiserror::Error;

use crate::credentials::{Credentials, CredentialsParseError};

/// The single well-known channel client handlers publish renewal requests to.
pub const AUTH_REQUESTS_CHANNEL: &str = "auth_requests";

/// Set holding the keys of report hashes with unflushed usage.
pub const SET_KEYS_CACHED_REPORTS: &str = "report_keys";

const SET_KEYS_FLUSHING_REPORTS: &str = "flushing_report_keys";
const AUTH_HASH_PREFIX: &str = "auth:";
const REPORT_HASH_PREFIX: &str = "report:";
const KEY_TO_FLUSH_PREFIX: &str = "to_flush:";
const AUTH_RESPONSES_CHANNEL_PREFIX: &str = "auth_response:";

/// Error recovering an application identity from a flushed report key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    /// The key does not carry the expected prefix or suffix.
    #[error("key {key:?} is not a flushed report key for this cycle")]
    UnexpectedShape {
        /// The offending key.
        key: String,
    },
    /// The credentials component failed to decode.
    #[error("key {key:?} carries undecodable credentials")]
    Credentials {
        /// The offending key.
        key: String,
        /// The decoding failure.
        #[source]
        source: CredentialsParseError,
    },
}

/// Key of the auth cache hash for one application.
#[must_use]
pub fn auth_hash_key(service_id: &str, credentials: &Credentials) -> String {
    format!("{AUTH_HASH_PREFIX}{service_id}:{}", credentials.to_sorted_escaped())
}

/// Key of the usage report counter hash for one application.
#[must_use]
pub fn report_hash_key(service_id: &str, credentials: &Credentials) -> String {
    format!("{REPORT_HASH_PREFIX}{service_id}:{}", credentials.to_sorted_escaped())
}

/// Key of the membership set being drained by the flush cycle `suffix`.
#[must_use]
pub fn flushing_set_key(suffix: &str) -> String {
    format!("{SET_KEYS_FLUSHING_REPORTS}{suffix}")
}

/// The name a report hash is parked under while the flush cycle `suffix`
/// drains it.
#[must_use]
pub fn key_to_flush(key: &str, suffix: &str) -> String {
    format!("{KEY_TO_FLUSH_PREFIX}{key}{suffix}")
}

/// Recovers the application identity from a key produced by
/// [`key_to_flush`] over a [`report_hash_key`] in the cycle `suffix`.
pub fn service_and_creds(
    flushed_key: &str,
    suffix: &str,
) -> Result<(String, Credentials), KeyParseError> {
    let unexpected = || KeyParseError::UnexpectedShape { key: flushed_key.to_owned() };

    let rest = flushed_key.strip_prefix(KEY_TO_FLUSH_PREFIX).ok_or_else(unexpected)?;
    let rest = rest.strip_suffix(suffix).ok_or_else(unexpected)?;
    let rest = rest.strip_prefix(REPORT_HASH_PREFIX).ok_or_else(unexpected)?;
    let (service_id, creds_part) = rest.split_once(':').ok_or_else(unexpected)?;

    let credentials = Credentials::parse_canonical(creds_part).map_err(|source| {
        KeyParseError::Credentials { key: flushed_key.to_owned(), source }
    })?;
    Ok((service_id.to_owned(), credentials))
}

/// Channel on which the renewer publishes the decision for one requested
/// metric of one application.
#[must_use]
pub fn auths_response_channel(
    service_id: &str,
    credentials: &Credentials,
    metric: &str,
) -> String {
    format!(
        "{AUTH_RESPONSES_CHANNEL_PREFIX}{service_id}:{}:{metric}",
        credentials.to_sorted_escaped(),
    )
}

/// Produces the unique suffix naming one flush cycle.
///
/// The suffix is `_<UTC timestamp YYYYMMDDHHMMSS>.<seq>` where `seq` is a
/// process-local monotonic counter. The counter disambiguates cycles that
/// start within the same second; across restarts the timestamp moves on
/// long before the counter could repeat against live flush state.
#[derive(Debug, Default)]
pub struct SuffixGenerator {
    seq: AtomicU64,
}

impl SuffixGenerator {
    /// A generator starting at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The suffix for the next flush cycle.
    #[must_use]
    pub fn next_suffix(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("_{}.{seq}", Utc::now().format("%Y%m%d%H%M%S"))
    }
}
