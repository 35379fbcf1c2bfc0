//! The renewal request wire value.
//!
//! Client handlers that miss the auth cache publish one of these on the
//! request channel, then wait on the per-request response channel. The
//! payload grammar is `service_id:<s>,<creds-canonical>,metric:<m>`, UTF-8
//! encoded; the credentials component is the canonical escaped form so the
//! commas and colons of the grammar stay unambiguous.

use thiserror::Error;

use crate::credentials::{Credentials, CredentialsParseError};

const SERVICE_ID_FIELD: &str = "service_id";
const METRIC_FIELD: &str = "metric";

/// One renewal request: an application plus the metric the handler missed.
///
/// Also the deduplication key for in-flight renewals: at most one renewal
/// task runs per distinct `AuthRequest` at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthRequest {
    /// The service the application belongs to.
    pub service_id: String,
    /// The application's credentials.
    pub credentials: Credentials,
    /// The metric whose authorization the handler needs.
    pub metric: String,
}

/// Error decoding a request-channel payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestParseError {
    /// The payload was not UTF-8.
    #[error("request payload is not valid UTF-8")]
    NotUtf8,
    /// The payload did not match the request grammar.
    #[error("request payload {payload:?} does not match the request grammar")]
    Grammar {
        /// The offending payload.
        payload: String,
    },
    /// The credentials component failed to decode.
    #[error("request payload {payload:?} carries undecodable credentials")]
    Credentials {
        /// The offending payload.
        payload: String,
        /// The decoding failure.
        #[source]
        source: CredentialsParseError,
    },
}

impl AuthRequest {
    /// Builds a request.
    #[must_use]
    pub fn new(
        service_id: impl Into<String>,
        credentials: Credentials,
        metric: impl Into<String>,
    ) -> Self {
        Self { service_id: service_id.into(), credentials, metric: metric.into() }
    }

    /// Encodes this request as its channel payload.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{SERVICE_ID_FIELD}:{},{},{METRIC_FIELD}:{}",
            self.service_id,
            self.credentials.to_sorted_escaped(),
            self.metric,
        )
    }

    /// Decodes a channel payload.
    pub fn parse(payload: &[u8]) -> Result<Self, RequestParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| RequestParseError::NotUtf8)?;
        let grammar = || RequestParseError::Grammar { payload: text.to_owned() };

        let tokens: Vec<&str> = text.split(',').collect();
        if tokens.len() < 2 {
            return Err(grammar());
        }

        let service_id = tokens[0]
            .strip_prefix(SERVICE_ID_FIELD)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(grammar)?;
        let metric = tokens[tokens.len() - 1]
            .strip_prefix(METRIC_FIELD)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(grammar)?;
        if service_id.is_empty() || metric.is_empty() {
            return Err(grammar());
        }

        let creds_part = tokens[1..tokens.len() - 1].join(",");
        let credentials =
            Credentials::parse_canonical(&creds_part).map_err(|source| {
                RequestParseError::Credentials { payload: text.to_owned(), source }
            })?;

        Ok(Self::new(service_id, credentials, metric))
    }
}
