//! In-memory KV backend implementation.
//!
//! This module provides [`MemoryKv`], an in-memory implementation of
//! [`KvBackend`] suitable for testing and development.
//!
//! # Features
//!
//! - **Thread-safe**: uses [`parking_lot::RwLock`] for concurrent access
//! - **TTL support**: a background task sweeps expired keys; reads treat
//!   expired keys as absent immediately
//! - **Atomic rename**: the key, its contents, and its TTL move together
//!   under one write lock, which is what the flush snapshot handoff relies on
//! - **Pub/sub**: per-channel [`tokio::sync::broadcast`] fan-out with
//!   fire-and-forget publish semantics
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - TTL sweeping runs every second, so physical removal is not precise
//!   (logical expiry is)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use crate::backend::{KvBackend, Subscription};
use crate::error::{KvError, KvResult};

/// Broadcast buffer per channel. A renewal response channel sees one
/// message; the request channel sees bursts bounded by handler fan-in.
const CHANNEL_CAPACITY: usize = 1024;

/// A stored value: the store distinguishes hashes from sets and rejects
/// operations of the wrong flavor, the way a real KV server does.
#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, Bytes>),
    Set(HashSet<String>),
}

/// In-memory KV backend.
///
/// # Cloning
///
/// `MemoryKv` is cheaply cloneable via [`Arc`]. All clones share the same
/// underlying store, so a test can hand one clone to the renewer as the
/// publisher, another as the subscriber, and keep a third to assert on.
#[derive(Clone)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, Value>>>,
    expiries: Arc<RwLock<HashMap<String, Instant>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl MemoryKv {
    /// Creates a new in-memory backend and spawns the background task that
    /// sweeps expired keys.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let kv = Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            expiries: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
        };

        let sweeper = kv.clone();
        tokio::spawn(async move {
            sweeper.sweep_expired_keys().await;
        });

        kv
    }

    /// Background task that physically removes expired keys.
    async fn sweep_expired_keys(&self) {
        loop {
            sleep(Duration::from_secs(1)).await;

            let now = Instant::now();
            let expired: Vec<String> = {
                let expiries = self.expiries.read();
                expiries
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect()
            };

            if !expired.is_empty() {
                let mut data = self.data.write();
                let mut expiries = self.expiries.write();
                tracing::trace!(count = expired.len(), "sweeping expired keys");
                for key in expired {
                    data.remove(&key);
                    expiries.remove(&key);
                }
            }
        }
    }

    fn is_expired(&self, key: &str) -> bool {
        self.expiries.read().get(key).is_some_and(|deadline| *deadline <= Instant::now())
    }

    /// Removes the key now if its TTL has elapsed, so write paths never
    /// resurrect logically-dead data.
    fn purge_if_expired(&self, key: &str) {
        if self.is_expired(key) {
            let mut data = self.data.write();
            let mut expiries = self.expiries.write();
            data.remove(key);
            expiries.remove(key);
        }
    }

    fn wrong_type(key: &str, wanted: &str) -> KvError {
        KvError::corrupt(key, format!("operation expects a {wanted}, key holds another type"))
    }

    /// Names of all live (non-expired) keys, in no particular order.
    ///
    /// Inspection helper for tests and debugging; server-backed backends
    /// have no counterpart to this.
    #[must_use]
    pub fn key_names(&self) -> Vec<String> {
        let data = self.data.read();
        data.keys().filter(|key| !self.is_expired(key)).cloned().collect()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn hash_set_multi(&self, key: &str, fields: &[(String, Bytes)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.purge_if_expired(key);

        let mut data = self.data.write();
        let value = data.entry(key.to_owned()).or_insert_with(|| Value::Hash(HashMap::new()));
        match value {
            Value::Hash(hash) => {
                for (field, payload) in fields {
                    hash.insert(field.clone(), payload.clone());
                }
                Ok(())
            },
            Value::Set(_) => Err(Self::wrong_type(key, "hash")),
        }
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<Vec<(String, Bytes)>> {
        if self.is_expired(key) {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => {
                Ok(hash.iter().map(|(field, payload)| (field.clone(), payload.clone())).collect())
            },
            Some(Value::Set(_)) => Err(Self::wrong_type(key, "hash")),
        }
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.purge_if_expired(key);

        let mut data = self.data.write();
        let value = data.entry(key.to_owned()).or_insert_with(|| Value::Hash(HashMap::new()));
        match value {
            Value::Hash(hash) => {
                let current = match hash.get(field) {
                    None => 0,
                    Some(raw) => std::str::from_utf8(raw)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| {
                            KvError::corrupt(key, format!("field {field} is not an integer"))
                        })?,
                };
                let next = current + delta;
                hash.insert(field.to_owned(), Bytes::from(next.to_string()));
                Ok(next)
            },
            Value::Set(_) => Err(Self::wrong_type(key, "hash")),
        }
    }

    async fn set_add(&self, key: &str, members: &[String]) -> KvResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.purge_if_expired(key);

        let mut data = self.data.write();
        let value = data.entry(key.to_owned()).or_insert_with(|| Value::Set(HashSet::new()));
        match value {
            Value::Set(set) => {
                for member in members {
                    set.insert(member.clone());
                }
                Ok(())
            },
            Value::Hash(_) => Err(Self::wrong_type(key, "set")),
        }
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        if self.is_expired(key) {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Value::Hash(_)) => Err(Self::wrong_type(key, "set")),
        }
    }

    async fn set_cardinality(&self, key: &str) -> KvResult<u64> {
        if self.is_expired(key) {
            return Ok(0);
        }
        let data = self.data.read();
        match data.get(key) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(Value::Hash(_)) => Err(Self::wrong_type(key, "set")),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> KvResult<()> {
        self.purge_if_expired(from);

        // One write lock across the whole move: a concurrent writer sees
        // either the old key or the new one, never both and never neither.
        let mut data = self.data.write();
        let mut expiries = self.expiries.write();

        let value = data.remove(from).ok_or_else(|| KvError::not_found(from))?;
        data.insert(to.to_owned(), value);

        expiries.remove(to);
        if let Some(deadline) = expiries.remove(from) {
            expiries.insert(to.to_owned(), deadline);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        self.purge_if_expired(key);

        let data = self.data.read();
        if !data.contains_key(key) {
            return Err(KvError::not_found(key));
        }
        let mut expiries = self.expiries.write();
        expiries.insert(key.to_owned(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> KvResult<()> {
        let mut data = self.data.write();
        let mut expiries = self.expiries.write();
        for key in keys {
            data.remove(key);
            expiries.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> KvResult<()> {
        let sender = {
            let channels = self.channels.read();
            channels.get(channel).cloned()
        };
        // No subscribers means no channel entry; the payload is simply lost,
        // matching the store's fire-and-forget broadcast.
        if let Some(sender) = sender {
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Subscription> {
        let mut channels = self.channels.write();
        let sender = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Subscription::from_broadcast(sender.subscribe()))
    }

    async fn ping(&self) -> KvResult<()> {
        let _unused = self.data.read();
        Ok(())
    }
}
