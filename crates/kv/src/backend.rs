//! KV backend trait definition.
//!
//! This module defines the [`KvBackend`] trait, the contract between the
//! daemon and the shared key/value store it keeps its caches in. The store
//! is expected to provide hashes with field-atomic increments, sets, key
//! rename, whole-key TTL, and fire-and-forget pub/sub.
//!
//! # Design Philosophy
//!
//! - **Keys, fields, and channels are strings**: the daemon's naming grammar
//!   is textual and must parse back unambiguously
//! - **Values and payloads are bytes**: the store itself is binary-safe;
//!   encoding decisions live in the layers above
//! - **Async by default**: every operation is blocking I/O against a shared
//!   server
//! - **No transactions**: the store offers none; the layers above are
//!   designed so every partial failure strands data recoverably
//!
//! # Implementing a Backend
//!
//! 1. Implement [`KvBackend`] and hand out [`Subscription`] values from
//!    `subscribe`
//! 2. Map backend-specific errors to [`KvError`](crate::KvError)
//!
//! See [`MemoryKv`](crate::MemoryKv) for the reference implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::{KvError, KvResult};

/// Abstract backend for the daemon's KV operations.
///
/// Backends must be thread-safe (`Send + Sync`) and tolerate concurrent
/// callers. A handle used for `subscribe` must not be shared with command
/// traffic: a subscribed connection issues no other commands, so callers
/// hold separate handles for publishing and subscribing.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`hash_set_multi`](KvBackend::hash_set_multi) | Write many hash fields at once |
/// | [`hash_get_all`](KvBackend::hash_get_all) | Read every field of a hash |
/// | [`hash_incr_by`](KvBackend::hash_incr_by) | Atomically increment an integer field |
/// | [`set_add`](KvBackend::set_add) | Add members to a set |
/// | [`set_members`](KvBackend::set_members) | Read all members of a set |
/// | [`set_cardinality`](KvBackend::set_cardinality) | Count members of a set |
/// | [`rename`](KvBackend::rename) | Atomically rename a key |
/// | [`expire`](KvBackend::expire) | Set a whole-key TTL |
/// | [`delete`](KvBackend::delete) | Remove keys |
/// | [`publish`](KvBackend::publish) | Broadcast a payload on a channel |
/// | [`subscribe`](KvBackend::subscribe) | Receive payloads from a channel |
/// | [`ping`](KvBackend::ping) | Verify the backend is reachable |
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Writes the given field/value pairs into the hash at `key`.
    ///
    /// The hash is created if absent; existing fields are overwritten.
    /// Callers chunk large writes themselves so a single call never blocks
    /// the server on an unbounded hash.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn hash_set_multi(&self, key: &str, fields: &[(String, Bytes)]) -> KvResult<()>;

    /// Reads every field of the hash at `key`.
    ///
    /// Returns an empty vector when the hash does not exist.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn hash_get_all(&self, key: &str) -> KvResult<Vec<(String, Bytes)>>;

    /// Atomically increments the integer stored at `field` of the hash at
    /// `key` by `delta`, creating the hash and the field (as `0`) when
    /// absent. Returns the value after the increment.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Corrupt`] when the existing field value is not a
    /// decimal integer.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    /// Adds `members` to the set at `key`, creating it when absent.
    /// Members already present are left alone.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn set_add(&self, key: &str, members: &[String]) -> KvResult<()>;

    /// Reads all members of the set at `key`.
    ///
    /// Returns an empty vector when the set does not exist. Ordering is
    /// unspecified.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    /// Returns the number of members in the set at `key` (`0` when absent).
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn set_cardinality(&self, key: &str) -> KvResult<u64>;

    /// Atomically renames `from` to `to`, overwriting any value at `to`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] when `from` does not exist.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn rename(&self, from: &str, to: &str) -> KvResult<()>;

    /// Sets a TTL on the whole key at `key`. The key and everything under
    /// it (all hash fields, all set members) expire together.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] when the key does not exist.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    /// Deletes the given keys. Missing keys are ignored.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn delete(&self, keys: &[String]) -> KvResult<()>;

    /// Broadcasts `payload` on `channel`.
    ///
    /// Delivery is fire-and-forget: subscribers that are not listening at
    /// this instant never see the payload, and success says nothing about
    /// how many subscribers received it.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn publish(&self, channel: &str, payload: Bytes) -> KvResult<()>;

    /// Subscribes to `channel`, returning a stream of payloads.
    ///
    /// Only payloads published after this call returns are delivered.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn subscribe(&self, channel: &str) -> KvResult<Subscription>;

    /// Verifies the backend is reachable.
    #[must_use = "KV operations may fail and errors must be handled"]
    async fn ping(&self) -> KvResult<()>;
}

/// Source of payloads behind a [`Subscription`].
///
/// Backend implementations provide one of these per subscribe call; the
/// in-memory backend adapts a broadcast receiver, a server-backed one
/// wraps its wire protocol.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next payload.
    async fn next(&mut self) -> KvResult<Bytes>;
}

/// A live subscription to a single channel.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    source: Box<dyn MessageSource>,
}

impl Subscription {
    /// Wraps a backend's message source. Backend implementations construct
    /// subscriptions with this; consumers only call [`next`](Self::next).
    #[must_use]
    pub fn new(source: Box<dyn MessageSource>) -> Self {
        Self { source }
    }

    /// A subscription fed by a [`tokio::sync::broadcast`] channel.
    #[must_use]
    pub fn from_broadcast(receiver: broadcast::Receiver<Bytes>) -> Self {
        Self::new(Box::new(receiver))
    }

    /// Waits for the next payload on the channel.
    ///
    /// # Errors
    ///
    /// - [`KvError::SubscriptionLagged`] when this subscriber fell behind
    ///   and the channel discarded messages; the subscription remains
    ///   usable and the next call resumes from the oldest retained payload
    /// - [`KvError::Closed`] when the channel is gone (backend dropped)
    pub async fn next(&mut self) -> KvResult<Bytes> {
        self.source.next().await
    }
}

#[async_trait]
impl MessageSource for broadcast::Receiver<Bytes> {
    async fn next(&mut self) -> KvResult<Bytes> {
        match self.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Err(KvError::SubscriptionLagged { skipped })
            },
            Err(broadcast::error::RecvError::Closed) => Err(KvError::Closed),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
