//! Shared test utilities for KV backend testing.
//!
//! The centerpiece is [`FailingKv`], a wrapper that injects configurable
//! failures into any [`KvBackend`]. Combined with [`MemoryKv`] it lets
//! tests fail exactly one stage of a multi-step protocol (the flush
//! snapshot, a batched hash write) and assert on what survives.
//!
//! Feature-gated behind `testutil`; enable it from `[dev-dependencies]`:
//!
//! ```toml
//! [dev-dependencies]
//! flushd-kv = { path = "../kv", features = ["testutil"] }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{KvBackend, Subscription};
use crate::error::{KvError, KvResult};
use crate::memory::MemoryKv;

/// Identifies a [`KvBackend`] method for targeted failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`KvBackend::hash_set_multi`]
    HashSetMulti,
    /// [`KvBackend::hash_get_all`]
    HashGetAll,
    /// [`KvBackend::hash_incr_by`]
    HashIncrBy,
    /// [`KvBackend::set_add`]
    SetAdd,
    /// [`KvBackend::set_members`]
    SetMembers,
    /// [`KvBackend::set_cardinality`]
    SetCardinality,
    /// [`KvBackend::rename`]
    Rename,
    /// [`KvBackend::expire`]
    Expire,
    /// [`KvBackend::delete`]
    Delete,
    /// [`KvBackend::publish`]
    Publish,
    /// [`KvBackend::subscribe`]
    Subscribe,
    /// [`KvBackend::ping`]
    Ping,
}

/// Factory that produces a [`KvError`] on each invocation.
pub type ErrorFactory = Arc<dyn Fn() -> KvError + Send + Sync>;

/// Returns a factory that produces [`KvError::Connection`] errors.
#[must_use]
pub fn error_factory_connection(detail: &str) -> ErrorFactory {
    let detail = detail.to_owned();
    Arc::new(move || KvError::connection(&detail))
}

/// Returns a factory that produces [`KvError::Internal`] errors.
#[must_use]
pub fn error_factory_internal(detail: &str) -> ErrorFactory {
    let detail = detail.to_owned();
    Arc::new(move || KvError::internal(detail.clone()))
}

/// Configures when and how a [`FailingKv`] injects failures.
///
/// Fail all renames immediately:
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use flushd_kv::testutil::{FailureConfig, Operation, error_factory_connection};
///
/// let config = FailureConfig::new(error_factory_connection("injected"))
///     .with_operations(vec![Operation::Rename]);
/// ```
pub struct FailureConfig {
    error_factory: ErrorFactory,
    /// Restrict failures to these operations. Empty = fail all operations.
    operations: Vec<Operation>,
    /// Succeed this many targeted operations before starting to fail.
    fail_after: usize,
}

impl FailureConfig {
    /// Create a config that fails all operations immediately with the given
    /// error factory.
    #[must_use]
    pub fn new(error_factory: ErrorFactory) -> Self {
        Self { error_factory, operations: Vec::new(), fail_after: 0 }
    }

    /// Restrict failures to the listed operations. Unlisted operations
    /// always delegate to the inner backend.
    #[must_use]
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    /// Allow `n` targeted operations to succeed before failures begin.
    #[must_use]
    pub fn with_fail_after(mut self, n: usize) -> Self {
        self.fail_after = n;
        self
    }
}

/// [`KvBackend`] wrapper that injects configurable failures.
///
/// Untargeted operations delegate directly to the inner backend, so wrapping
/// a [`MemoryKv`] gives a self-contained store where exactly the chosen
/// stage of a protocol fails.
///
/// The failure counter is shared via [`Arc`], making it safe to clone and
/// use across concurrent tasks.
pub struct FailingKv<B> {
    inner: B,
    error_factory: ErrorFactory,
    operations: Vec<Operation>,
    counter: Arc<AtomicUsize>,
    fail_after: usize,
}

impl<B: Clone> Clone for FailingKv<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            error_factory: Arc::clone(&self.error_factory),
            operations: self.operations.clone(),
            counter: Arc::clone(&self.counter),
            fail_after: self.fail_after,
        }
    }
}

impl<B> FailingKv<B> {
    /// Wrap the given backend with the provided failure configuration.
    pub fn wrap(inner: B, config: FailureConfig) -> Self {
        Self {
            inner,
            error_factory: config.error_factory,
            operations: config.operations,
            counter: Arc::new(AtomicUsize::new(0)),
            fail_after: config.fail_after,
        }
    }

    /// Returns the number of targeted operations attempted so far,
    /// successful or failed. Useful for asserting that a protocol stopped
    /// issuing targeted calls after an injected failure.
    #[must_use]
    pub fn targeted_ops(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Resets the operation counter to zero.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    fn is_targeted(&self, op: Operation) -> bool {
        self.operations.is_empty() || self.operations.contains(&op)
    }

    fn check_failure(&self, op: Operation) -> KvResult<()> {
        if !self.is_targeted(op) {
            return Ok(());
        }
        let prev = self.counter.fetch_add(1, Ordering::Relaxed);
        if prev >= self.fail_after { Err((self.error_factory)()) } else { Ok(()) }
    }
}

/// Convenience constructor for the common `FailingKv<MemoryKv>` shape.
pub fn failing_memory_kv(config: FailureConfig) -> FailingKv<MemoryKv> {
    FailingKv::wrap(MemoryKv::new(), config)
}

#[async_trait]
impl<B: KvBackend> KvBackend for FailingKv<B> {
    async fn hash_set_multi(&self, key: &str, fields: &[(String, Bytes)]) -> KvResult<()> {
        self.check_failure(Operation::HashSetMulti)?;
        self.inner.hash_set_multi(key, fields).await
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<Vec<(String, Bytes)>> {
        self.check_failure(Operation::HashGetAll)?;
        self.inner.hash_get_all(key).await
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.check_failure(Operation::HashIncrBy)?;
        self.inner.hash_incr_by(key, field, delta).await
    }

    async fn set_add(&self, key: &str, members: &[String]) -> KvResult<()> {
        self.check_failure(Operation::SetAdd)?;
        self.inner.set_add(key, members).await
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        self.check_failure(Operation::SetMembers)?;
        self.inner.set_members(key).await
    }

    async fn set_cardinality(&self, key: &str) -> KvResult<u64> {
        self.check_failure(Operation::SetCardinality)?;
        self.inner.set_cardinality(key).await
    }

    async fn rename(&self, from: &str, to: &str) -> KvResult<()> {
        self.check_failure(Operation::Rename)?;
        self.inner.rename(from, to).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        self.check_failure(Operation::Expire)?;
        self.inner.expire(key, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> KvResult<()> {
        self.check_failure(Operation::Delete)?;
        self.inner.delete(keys).await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> KvResult<()> {
        self.check_failure(Operation::Publish)?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Subscription> {
        self.check_failure(Operation::Subscribe)?;
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> KvResult<()> {
        self.check_failure(Operation::Ping)?;
        self.inner.ping().await
    }
}
