//! Application credentials and their canonical wire form.
//!
//! Credentials are an opaque set of identifier fields (a user key, an
//! app-id/app-key pair, or an OAuth access token). They appear inside KV
//! keys and channel names, so they need a canonical string form that is
//! deterministic and parses back unambiguously: fields sorted by name,
//! with the grammar delimiters (`:`, `,`) and the escape character itself
//! (`%`) percent-escaped.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

/// Credential field naming an OAuth access token. Its presence selects the
/// upstream's OAuth authorization endpoint.
pub const ACCESS_TOKEN: &str = "access_token";

/// Characters escaped in the canonical form: the field and pair delimiters
/// of the key/channel grammar, and `%` so decoding is unambiguous.
const CANONICAL_ESCAPES: &AsciiSet = &CONTROLS.add(b':').add(b',').add(b'%');

/// An application's credential fields.
///
/// Field order is canonical (sorted by name) because the map is a
/// [`BTreeMap`]; two credential sets with the same fields always produce
/// the same canonical string, KV keys, and channel names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    creds: BTreeMap<String, String>,
}

/// Error decoding a canonical credentials string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsParseError {
    /// A comma-separated pair had no `:` separator.
    #[error("credential pair {pair:?} has no field/value separator")]
    MissingSeparator {
        /// The offending pair.
        pair: String,
    },
    /// A percent-escape did not decode to valid UTF-8.
    #[error("credential pair {pair:?} contains invalid percent-escapes")]
    InvalidEscape {
        /// The offending pair.
        pair: String,
    },
}

impl Credentials {
    /// Credentials from an arbitrary field map.
    #[must_use]
    pub fn new(creds: BTreeMap<String, String>) -> Self {
        Self { creds }
    }

    /// User-key credentials.
    #[must_use]
    pub fn from_user_key(user_key: impl Into<String>) -> Self {
        let mut creds = BTreeMap::new();
        creds.insert("user_key".to_owned(), user_key.into());
        Self { creds }
    }

    /// App-id credentials, with an optional app key.
    #[must_use]
    pub fn from_app_id(app_id: impl Into<String>, app_key: Option<String>) -> Self {
        let mut creds = BTreeMap::new();
        creds.insert("app_id".to_owned(), app_id.into());
        if let Some(app_key) = app_key {
            creds.insert("app_key".to_owned(), app_key);
        }
        Self { creds }
    }

    /// OAuth access-token credentials.
    #[must_use]
    pub fn from_access_token(token: impl Into<String>) -> Self {
        let mut creds = BTreeMap::new();
        creds.insert(ACCESS_TOKEN.to_owned(), token.into());
        Self { creds }
    }

    /// The credential fields.
    #[must_use]
    pub fn creds(&self) -> &BTreeMap<String, String> {
        &self.creds
    }

    /// Whether these credentials authorize via the upstream's OAuth
    /// endpoint (they carry an [`ACCESS_TOKEN`] field).
    #[must_use]
    pub fn oauth(&self) -> bool {
        self.creds.contains_key(ACCESS_TOKEN)
    }

    /// The canonical string form: `field:value` pairs joined by `,`, fields
    /// in sorted order, values and fields percent-escaped.
    #[must_use]
    pub fn to_sorted_escaped(&self) -> String {
        let pairs: Vec<String> = self
            .creds
            .iter()
            .map(|(field, value)| {
                format!(
                    "{}:{}",
                    utf8_percent_encode(field, CANONICAL_ESCAPES),
                    utf8_percent_encode(value, CANONICAL_ESCAPES),
                )
            })
            .collect();
        pairs.join(",")
    }

    /// Decodes a canonical string back into credentials.
    ///
    /// The empty string decodes to an empty credential set.
    pub fn parse_canonical(raw: &str) -> Result<Self, CredentialsParseError> {
        let mut creds = BTreeMap::new();
        if raw.is_empty() {
            return Ok(Self { creds });
        }
        for pair in raw.split(',') {
            let (field, value) = pair.split_once(':').ok_or_else(|| {
                CredentialsParseError::MissingSeparator { pair: pair.to_owned() }
            })?;
            let field = unescape(field, pair)?;
            let value = unescape(value, pair)?;
            creds.insert(field, value);
        }
        Ok(Self { creds })
    }
}

fn unescape(part: &str, pair: &str) -> Result<String, CredentialsParseError> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| CredentialsParseError::InvalidEscape { pair: pair.to_owned() })
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sorted_escaped())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fields_are_sorted_in_canonical_form() {
        let creds = Credentials::from_app_id("id-1", Some("key-1".to_owned()));
        assert_eq!(creds.to_sorted_escaped(), "app_id:id-1,app_key:key-1");
    }

    #[test]
    fn delimiters_are_escaped() {
        let mut map = BTreeMap::new();
        map.insert("user_key".to_owned(), "a:b,c%d".to_owned());
        let creds = Credentials::new(map);
        assert_eq!(creds.to_sorted_escaped(), "user_key:a%3Ab%2Cc%25d");
    }

    #[test]
    fn canonical_form_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("user_key".to_owned(), "weird:value,with%stuff".to_owned());
        map.insert("plain".to_owned(), "simple".to_owned());
        let creds = Credentials::new(map);

        let parsed = Credentials::parse_canonical(&creds.to_sorted_escaped()).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn oauth_is_derived_from_access_token_field() {
        assert!(Credentials::from_access_token("tok").oauth());
        assert!(!Credentials::from_user_key("uk").oauth());
        assert!(!Credentials::from_app_id("id", None).oauth());
    }

    #[test]
    fn empty_string_parses_to_empty_credentials() {
        let creds = Credentials::parse_canonical("").unwrap();
        assert!(creds.creds().is_empty());
    }

    #[test]
    fn pair_without_separator_is_rejected() {
        let err = Credentials::parse_canonical("no-separator").unwrap_err();
        assert!(matches!(err, CredentialsParseError::MissingSeparator { .. }));
    }

    proptest! {
        /// Any credential map survives encode-then-parse, no matter which
        /// delimiter or escape characters appear in fields and values.
        #[test]
        fn any_credentials_round_trip(
            entries in proptest::collection::btree_map("[a-z_:%,]{1,12}", ".{0,16}", 0..4)
        ) {
            let creds = Credentials::new(entries);
            let parsed = Credentials::parse_canonical(&creds.to_sorted_escaped()).unwrap();
            prop_assert_eq!(parsed, creds);
        }
    }
}
