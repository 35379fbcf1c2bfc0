//! Translating one upstream call into per-metric decisions.
//!
//! The [`Authorizer`] makes a single authorize call for an application and
//! expands the answer into a map of every relevant metric to its
//! [`Authorization`], applying hierarchy-aware limit propagation: a parent
//! metric denied over limits denies all of its children, without consulting
//! their own counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::auth::Authorization;
use crate::credentials::Credentials;
use crate::error::AuthorizeError;
use crate::upstream::{AuthResult, UpstreamClient, UpstreamError, UsageReport};

/// Computes per-metric authorization maps by asking the upstream.
///
/// Upstream flavor selection (OAuth or not) is confined here; callers just
/// hand over credentials.
pub struct Authorizer {
    upstream: Arc<dyn UpstreamClient>,
}

impl Authorizer {
    /// An authorizer backed by the given upstream client.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { upstream }
    }

    /// Decides every relevant metric of an application in one upstream
    /// round trip.
    ///
    /// `reported_metrics` are the metrics the caller needs an answer for;
    /// the returned map covers the union of those and every metric the
    /// upstream reported usage for, so one renewal refreshes the whole
    /// application's cache entry.
    ///
    /// # Errors
    ///
    /// [`AuthorizeError::UpstreamUnavailable`] when the upstream cannot be
    /// reached; any other upstream failure passes through unwrapped as
    /// [`AuthorizeError::Upstream`].
    pub async fn authorizations(
        &self,
        service_id: &str,
        credentials: &Credentials,
        reported_metrics: &[String],
    ) -> Result<HashMap<String, Authorization>, AuthorizeError> {
        let result = if credentials.oauth() {
            self.upstream.oauth_authorize(service_id, credentials).await
        } else {
            self.upstream.authorize(service_id, credentials).await
        };

        let result = result.map_err(|err| match err {
            unavailable @ UpstreamError::Unavailable { .. } => {
                AuthorizeError::UpstreamUnavailable {
                    service_id: service_id.to_owned(),
                    credentials: credentials.clone(),
                    source: unavailable,
                }
            },
            other => AuthorizeError::Upstream(other),
        })?;

        if !result.success && !result.limits_exceeded {
            // A denial unrelated to limits (unknown app, bad key, ...)
            // applies to every metric the caller asked about.
            let denial = match &result.error_code {
                Some(code) => Authorization::deny(code.clone()),
                None => Authorization::deny_unspecified(),
            };
            return Ok(reported_metrics
                .iter()
                .map(|metric| (metric.clone(), denial.clone()))
                .collect());
        }

        Ok(Self::auths_according_to_limits(&result, reported_metrics))
    }

    /// Expands usage counters into per-metric decisions.
    ///
    /// Metrics with no counters are unlimited and allowed. Parents are
    /// decided before leaves; a parent over its limit denies every child
    /// under it, and a metric already decided that way is not re-checked
    /// against its own counters.
    fn auths_according_to_limits(
        result: &AuthResult,
        reported_metrics: &[String],
    ) -> HashMap<String, Authorization> {
        let mut metrics_usage: BTreeMap<String, Vec<&UsageReport>> = BTreeMap::new();
        for metric in reported_metrics {
            metrics_usage.entry(metric.clone()).or_default();
        }
        for report in &result.usage_reports {
            metrics_usage.entry(report.metric.clone()).or_default().push(report);
        }

        let (parents, leaves): (Vec<String>, Vec<String>) = metrics_usage
            .keys()
            .cloned()
            .partition(|metric| result.hierarchy.contains_key(metric));

        let mut auths = HashMap::with_capacity(metrics_usage.len());
        for metric in parents.into_iter().chain(leaves) {
            if auths.contains_key(&metric) {
                continue;
            }
            let usages = &metrics_usage[&metric];
            if usages.iter().all(|usage| usage.within_limit()) {
                auths.insert(metric, Authorization::Allow);
            } else {
                if let Some(children) = result.hierarchy.get(&metric) {
                    for child in children {
                        auths.insert(child.clone(), Authorization::DenyOverLimits);
                    }
                }
                auths.insert(metric, Authorization::DenyOverLimits);
            }
        }
        auths
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Upstream double that replays a scripted answer and counts which
    /// endpoint was hit.
    struct ScriptedUpstream {
        answer: Result<AuthResult, UpstreamError>,
        plain_calls: AtomicUsize,
        oauth_calls: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn answering(answer: Result<AuthResult, UpstreamError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                plain_calls: AtomicUsize::new(0),
                oauth_calls: AtomicUsize::new(0),
            })
        }

        fn replay(&self) -> Result<AuthResult, UpstreamError> {
            match &self.answer {
                Ok(result) => Ok(result.clone()),
                Err(UpstreamError::Unavailable { message, .. }) => {
                    Err(UpstreamError::unavailable(message.clone()))
                },
                Err(UpstreamError::Client { message, .. }) => {
                    Err(UpstreamError::client(message.clone()))
                },
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn authorize(
            &self,
            _service_id: &str,
            _credentials: &Credentials,
        ) -> Result<AuthResult, UpstreamError> {
            self.plain_calls.fetch_add(1, Ordering::Relaxed);
            self.replay()
        }

        async fn oauth_authorize(
            &self,
            _service_id: &str,
            _credentials: &Credentials,
        ) -> Result<AuthResult, UpstreamError> {
            self.oauth_calls.fetch_add(1, Ordering::Relaxed);
            self.replay()
        }
    }

    fn usage(metric: &str, current: u64, max: u64) -> UsageReport {
        UsageReport { metric: metric.to_owned(), current_value: current, max_value: max }
    }

    fn metrics(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[tokio::test]
    async fn within_limits_allows() {
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::authorized(
            vec![usage("hits", 1, 10)],
            HashMap::new(),
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["hits"]))
            .await
            .unwrap();

        assert_eq!(auths.get("hits"), Some(&Authorization::Allow));
    }

    #[tokio::test]
    async fn metric_without_usage_reports_is_allowed() {
        let upstream =
            ScriptedUpstream::answering(Ok(AuthResult::authorized(vec![], HashMap::new())));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["unlimited"]))
            .await
            .unwrap();

        assert_eq!(auths.get("unlimited"), Some(&Authorization::Allow));
    }

    #[tokio::test]
    async fn non_limit_denial_applies_to_all_requested_metrics() {
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied(Some(
            "user.blocked".to_owned(),
        ))));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(auths.len(), 2);
        assert_eq!(auths.get("a"), Some(&Authorization::deny("user.blocked")));
        assert_eq!(auths.get("b"), Some(&Authorization::deny("user.blocked")));
    }

    #[tokio::test]
    async fn non_limit_denial_without_code_has_no_reason() {
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied(None)));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["m"]))
            .await
            .unwrap();

        assert_eq!(auths.get("m"), Some(&Authorization::deny_unspecified()));
    }

    #[tokio::test]
    async fn exhausted_metric_is_denied_over_limits() {
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied_over_limits(
            vec![usage("hits", 10, 10)],
            HashMap::new(),
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["hits"]))
            .await
            .unwrap();

        assert_eq!(auths.get("hits"), Some(&Authorization::DenyOverLimits));
    }

    #[tokio::test]
    async fn one_exhausted_counter_denies_the_metric() {
        // Day counter fine, month counter exhausted.
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied_over_limits(
            vec![usage("hits", 1, 100), usage("hits", 500, 500)],
            HashMap::new(),
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["hits"]))
            .await
            .unwrap();

        assert_eq!(auths.get("hits"), Some(&Authorization::DenyOverLimits));
    }

    #[tokio::test]
    async fn denied_parent_denies_every_child() {
        let hierarchy = HashMap::from([(
            "parent".to_owned(),
            vec!["child_a".to_owned(), "child_b".to_owned()],
        )]);
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied_over_limits(
            vec![
                usage("parent", 10, 10),
                // child_a has its own headroom, which must not matter.
                usage("child_a", 0, 100),
            ],
            hierarchy,
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["child_a"]))
            .await
            .unwrap();

        assert_eq!(auths.get("parent"), Some(&Authorization::DenyOverLimits));
        assert_eq!(auths.get("child_a"), Some(&Authorization::DenyOverLimits));
        assert_eq!(auths.get("child_b"), Some(&Authorization::DenyOverLimits));
    }

    #[tokio::test]
    async fn allowed_parent_leaves_children_to_their_own_counters() {
        let hierarchy = HashMap::from([("parent".to_owned(), vec!["child".to_owned()])]);
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::denied_over_limits(
            vec![usage("parent", 1, 10), usage("child", 5, 5)],
            hierarchy,
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["child"]))
            .await
            .unwrap();

        assert_eq!(auths.get("parent"), Some(&Authorization::Allow));
        assert_eq!(auths.get("child"), Some(&Authorization::DenyOverLimits));
    }

    #[tokio::test]
    async fn result_covers_requested_and_reported_metrics() {
        let upstream = ScriptedUpstream::answering(Ok(AuthResult::authorized(
            vec![usage("metric2", 1, 10), usage("metric3", 2, 10)],
            HashMap::new(),
        )));
        let authorizer = Authorizer::new(upstream);

        let auths = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["metric"]))
            .await
            .unwrap();

        let mut keys: Vec<&str> = auths.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["metric", "metric2", "metric3"]);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_translated() {
        let upstream =
            ScriptedUpstream::answering(Err(UpstreamError::unavailable("connection refused")));
        let authorizer = Authorizer::new(upstream);

        let err = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["m"]))
            .await
            .unwrap_err();

        match err {
            AuthorizeError::UpstreamUnavailable { service_id, .. } => {
                assert_eq!(service_id, "svc");
            },
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_pass_through_unwrapped() {
        let upstream = ScriptedUpstream::answering(Err(UpstreamError::client("bad payload")));
        let authorizer = Authorizer::new(upstream);

        let err = authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["m"]))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizeError::Upstream(UpstreamError::Client { .. })));
    }

    #[tokio::test]
    async fn oauth_credentials_use_the_oauth_endpoint() {
        let upstream =
            ScriptedUpstream::answering(Ok(AuthResult::authorized(vec![], HashMap::new())));
        let authorizer = Authorizer::new(Arc::clone(&upstream) as Arc<dyn UpstreamClient>);

        authorizer
            .authorizations("svc", &Credentials::from_access_token("tok"), &metrics(&["m"]))
            .await
            .unwrap();
        assert_eq!(upstream.oauth_calls.load(Ordering::Relaxed), 1);
        assert_eq!(upstream.plain_calls.load(Ordering::Relaxed), 0);

        authorizer
            .authorizations("svc", &Credentials::from_user_key("uk"), &metrics(&["m"]))
            .await
            .unwrap();
        assert_eq!(upstream.plain_calls.load(Ordering::Relaxed), 1);
    }
}
