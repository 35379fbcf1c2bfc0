//! Authorization decisions and their cache encoding.
//!
//! An [`Authorization`] is what the upstream decides about one metric of
//! one application. It is stored in the shared auth cache hash and sent on
//! response channels as a short string, so the encoding is part of the
//! daemon's external contract and must stay stable:
//!
//! | Decision | Cache string |
//! |----------|--------------|
//! | allow | `"1"` |
//! | deny, no reason | `"0"` |
//! | deny with reason | `"0:<reason>"` |
//! | deny over limits | `"0:limits_exceeded"` |

/// Stable sentinel reason for denials caused by exceeded usage limits.
///
/// Consumers parse this value out of `"0:limits_exceeded"`; it is part of
/// the cache contract and must not change.
pub const LIMITS_EXCEEDED: &str = "limits_exceeded";

/// An upstream authorization decision for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Authorization {
    /// The metric may be used.
    Allow,
    /// The metric may not be used, optionally with an upstream reason code
    /// (e.g. `user.blocked`, `application_key_invalid`).
    Deny {
        /// Upstream reason code, when one was given.
        reason: Option<String>,
    },
    /// The metric may not be used because a usage limit is exhausted.
    ///
    /// Encodes identically to [`Authorization::Deny`] with the
    /// [`LIMITS_EXCEEDED`] reason; it is a distinct variant because the
    /// authorizer treats over-limit denials specially (they propagate to
    /// child metrics).
    DenyOverLimits,
}

impl Authorization {
    /// A denial carrying the given reason code.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny { reason: Some(reason.into()) }
    }

    /// A denial with no reason code.
    #[must_use]
    pub fn deny_unspecified() -> Self {
        Self::Deny { reason: None }
    }

    /// Returns `true` for [`Authorization::Allow`].
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The reason code carried by a denial, if any.
    ///
    /// [`Authorization::DenyOverLimits`] reports [`LIMITS_EXCEEDED`].
    #[must_use]
    pub fn deny_reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => reason.as_deref(),
            Self::DenyOverLimits => Some(LIMITS_EXCEEDED),
        }
    }

    /// Encodes this decision as its cache string.
    #[must_use]
    pub fn to_cache_value(&self) -> String {
        match self {
            Self::Allow => "1".to_owned(),
            Self::Deny { reason: None } => "0".to_owned(),
            Self::Deny { reason: Some(reason) } => format!("0:{reason}"),
            Self::DenyOverLimits => format!("0:{LIMITS_EXCEEDED}"),
        }
    }

    /// Decodes a cache string back into a decision.
    ///
    /// Returns `None` for strings that no version of
    /// [`to_cache_value`](Self::to_cache_value) produces. A denial whose
    /// reason equals [`LIMITS_EXCEEDED`] decodes as
    /// [`Authorization::DenyOverLimits`], so decisions round-trip.
    #[must_use]
    pub fn from_cache_value(raw: &str) -> Option<Self> {
        match raw {
            "1" => Some(Self::Allow),
            "0" => Some(Self::Deny { reason: None }),
            _ => match raw.split_once(':') {
                Some(("0", LIMITS_EXCEEDED)) => Some(Self::DenyOverLimits),
                Some(("0", reason)) if !reason.is_empty() => Some(Self::deny(reason)),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_encodes_as_one() {
        assert_eq!(Authorization::Allow.to_cache_value(), "1");
        assert!(Authorization::Allow.is_authorized());
    }

    #[test]
    fn deny_without_reason_encodes_as_zero() {
        let auth = Authorization::deny_unspecified();
        assert_eq!(auth.to_cache_value(), "0");
        assert!(!auth.is_authorized());
        assert_eq!(auth.deny_reason(), None);
    }

    #[test]
    fn deny_with_reason_carries_it() {
        let auth = Authorization::deny("user.blocked");
        assert_eq!(auth.to_cache_value(), "0:user.blocked");
        assert_eq!(auth.deny_reason(), Some("user.blocked"));
    }

    #[test]
    fn over_limits_uses_the_sentinel() {
        let auth = Authorization::DenyOverLimits;
        assert_eq!(auth.to_cache_value(), "0:limits_exceeded");
        assert_eq!(auth.deny_reason(), Some(LIMITS_EXCEEDED));
        // The sentinel encoding is indistinguishable from a plain denial
        // with the same reason, by design.
        assert_eq!(auth.to_cache_value(), Authorization::deny(LIMITS_EXCEEDED).to_cache_value());
    }

    #[test]
    fn decisions_round_trip_through_the_cache_encoding() {
        let cases = [
            Authorization::Allow,
            Authorization::deny_unspecified(),
            Authorization::deny("user.blocked"),
            Authorization::DenyOverLimits,
        ];
        for auth in cases {
            let decoded = Authorization::from_cache_value(&auth.to_cache_value());
            assert_eq!(decoded, Some(auth));
        }
    }

    #[test]
    fn garbage_does_not_decode() {
        for raw in ["", "2", "00", "1:extra", "0:", "allow"] {
            assert_eq!(Authorization::from_cache_value(raw), None, "raw: {raw:?}");
        }
    }
}
