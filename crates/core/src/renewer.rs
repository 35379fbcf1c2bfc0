//! The priority auth renewer.
//!
//! A client handler that misses the auth cache publishes an [`AuthRequest`]
//! on the request channel and waits on the per-request response channel.
//! The renewer subscribes to the request channel, deduplicates against the
//! set of renewals already in flight, and runs each renewal on a bounded
//! worker pool: ask the upstream, write the application's whole
//! authorization map to the cache, then publish the requested metric's
//! decision.
//!
//! Ordering is cache first, then publish, so a waiter that re-reads the
//! cache after a response always sees a value at least as fresh as the
//! response. The publish itself is best-effort: late subscribers get
//! nothing replayed and fall back to the cache.
//!
//! The intake loop survives everything except the subscription primitive
//! itself failing: malformed payloads are skipped, duplicate requests are
//! absorbed, and a failing renewal only logs. When the pool is saturated
//! the loop waits for a permit instead of dropping work, so a request
//! flood slows intake rather than silently shedding renewals.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flushd_kv::{KvBackend, KvError};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::authorizer::Authorizer;
use crate::config::WorkerConfig;
use crate::error::RenewerError;
use crate::keys::{self, AUTH_REQUESTS_CHANNEL};
use crate::request::AuthRequest;
use crate::storage::Storage;

/// Pub/sub-driven, deduplicating, bounded-concurrency renewal worker.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct PriorityAuthRenewer {
    inner: Arc<Inner>,
}

struct Inner {
    authorizer: Authorizer,
    storage: Storage,
    publisher: Arc<dyn KvBackend>,
    subscriber: Arc<dyn KvBackend>,
    auth_ttl: Duration,
    workers: Arc<Semaphore>,
    current_auths: Arc<Mutex<HashSet<AuthRequest>>>,
    shutdown: watch::Sender<bool>,
}

/// Removes its request from the in-flight set when dropped, which happens
/// at the end of the renewal task no matter how the task ends.
struct RenewalGuard {
    current_auths: Arc<Mutex<HashSet<AuthRequest>>>,
    request: AuthRequest,
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.current_auths.lock().remove(&self.request);
    }
}

impl PriorityAuthRenewer {
    /// Builds a renewer.
    ///
    /// `publisher` and `subscriber` must be distinct KV handles: a
    /// subscribed connection issues no other commands. The worker pool
    /// admits at most `workers.max` concurrent renewals.
    #[must_use]
    pub fn new(
        authorizer: Authorizer,
        storage: Storage,
        publisher: Arc<dyn KvBackend>,
        subscriber: Arc<dyn KvBackend>,
        auth_ttl: Duration,
        workers: &WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                authorizer,
                storage,
                publisher,
                subscriber,
                auth_ttl,
                workers: Arc::new(Semaphore::new(workers.max)),
                current_auths: Arc::new(Mutex::new(HashSet::new())),
                shutdown,
            }),
        }
    }

    /// Runs the request subscription loop.
    ///
    /// Blocks until [`shutdown`](Self::shutdown) is called or the
    /// subscription primitive fails. Either way the worker pool is drained
    /// before returning: no new tasks are accepted and in-flight renewals
    /// run to completion.
    ///
    /// # Errors
    ///
    /// [`RenewerError::Subscription`] when subscribing fails or the
    /// subscription dies mid-loop. The error is logged before being
    /// returned; the process is expected to restart.
    pub async fn start(&self) -> Result<(), RenewerError> {
        let mut subscription =
            self.inner.subscriber.subscribe(AUTH_REQUESTS_CHANNEL).await.map_err(|err| {
                error!(error = %err, "failed to subscribe to the request channel");
                RenewerError::Subscription(err)
            })?;
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();

        let result = if *shutdown.borrow() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break Ok(()),
                    payload = subscription.next() => match payload {
                        Ok(payload) => self.dispatch(payload, &mut tasks).await,
                        Err(KvError::SubscriptionLagged { skipped }) => {
                            // Dropped requests are retried by their handlers
                            // on the next cache miss; the loop keeps going.
                            warn!(skipped, "request subscription lagged");
                        },
                        Err(err) => {
                            error!(error = %err, "request subscription failed");
                            break Err(RenewerError::Subscription(err));
                        },
                    },
                }
                self.reap_finished(&mut tasks);
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_err) = joined {
                error!(error = %join_err, "renewal task panicked");
            }
        }
        result
    }

    /// Signals the subscription loop to stop accepting work and drain.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Number of renewals currently in flight.
    #[must_use]
    pub fn in_flight_renewals(&self) -> usize {
        self.inner.current_auths.lock().len()
    }

    /// Parses one request payload and hands it to the worker pool.
    async fn dispatch(&self, payload: Bytes, tasks: &mut JoinSet<()>) {
        let request = match AuthRequest::parse(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "skipping malformed renewal request");
                return;
            },
        };

        let Some(guard) = self.try_begin_renewal(&request) else {
            // A running task for the same tuple will publish on the same
            // response channel and satisfy every waiter.
            debug!(
                service_id = %request.service_id,
                metric = %request.metric,
                "renewal already in flight"
            );
            return;
        };

        if self.inner.workers.available_permits() == 0 {
            debug!("renewal workers saturated, intake waiting");
        }
        let permit = match Arc::clone(&self.inner.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_closed) => {
                error!("renewal worker pool closed, dropping request");
                return;
            },
        };

        let renewer = self.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            renewer.renew_and_publish(request).await;
        });
    }

    /// Atomic contains-then-insert on the in-flight set. Returns the
    /// release guard when this request was not already being renewed.
    fn try_begin_renewal(&self, request: &AuthRequest) -> Option<RenewalGuard> {
        let mut current = self.inner.current_auths.lock();
        if current.insert(request.clone()) {
            Some(RenewalGuard {
                current_auths: Arc::clone(&self.inner.current_auths),
                request: request.clone(),
            })
        } else {
            None
        }
    }

    /// One renewal: upstream decision, cache write, response publish.
    async fn renew_and_publish(&self, request: AuthRequest) {
        let authorizations = match self
            .inner
            .authorizer
            .authorizations(
                &request.service_id,
                &request.credentials,
                std::slice::from_ref(&request.metric),
            )
            .await
        {
            Ok(authorizations) => authorizations,
            Err(err) => {
                error!(
                    error = %err,
                    service_id = %request.service_id,
                    metric = %request.metric,
                    "authorization renewal failed"
                );
                return;
            },
        };

        if let Err(err) = self
            .inner
            .storage
            .renew_auths(&request.service_id, &request.credentials, &authorizations, self.inner.auth_ttl)
            .await
        {
            error!(error = %err, "failed to write renewed auths");
            return;
        }

        let Some(auth) = authorizations.get(&request.metric) else {
            error!(
                service_id = %request.service_id,
                metric = %request.metric,
                "renewed authorizations missing the requested metric"
            );
            return;
        };

        let channel = keys::auths_response_channel(
            &request.service_id,
            &request.credentials,
            &request.metric,
        );
        if let Err(err) =
            self.inner.publisher.publish(&channel, Bytes::from(auth.to_cache_value())).await
        {
            // The cache write above already satisfies retry paths.
            warn!(error = %err, %channel, "response publish failed, waiters must re-read the cache");
        }
    }

    fn reap_finished(&self, tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.try_join_next() {
            if let Err(join_err) = joined {
                error!(error = %join_err, "renewal task panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::credentials::Credentials;

    use super::*;

    fn request(metric: &str) -> AuthRequest {
        AuthRequest::new("svc", Credentials::from_user_key("uk"), metric)
    }

    fn in_flight_set() -> Arc<Mutex<HashSet<AuthRequest>>> {
        Arc::new(Mutex::new(HashSet::new()))
    }

    #[test]
    fn guard_releases_its_request_on_drop() {
        let current = in_flight_set();
        current.lock().insert(request("m"));

        let guard =
            RenewalGuard { current_auths: Arc::clone(&current), request: request("m") };
        assert_eq!(current.lock().len(), 1);

        drop(guard);
        assert!(current.lock().is_empty());
    }

    #[test]
    fn guard_only_releases_its_own_request() {
        let current = in_flight_set();
        current.lock().insert(request("m"));
        current.lock().insert(request("other"));

        drop(RenewalGuard { current_auths: Arc::clone(&current), request: request("m") });

        let remaining = current.lock();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains(&request("other")));
    }
}
