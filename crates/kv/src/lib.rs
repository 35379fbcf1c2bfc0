//! KV store contract for the flushd daemon.
//!
//! This crate defines the [`KvBackend`] trait — the boundary between the
//! daemon and the shared key/value store holding its authorization cache,
//! its usage counters, and its request/response channels — plus a reference
//! in-memory implementation for tests and development.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      flushd-core                            │
//! │   Storage (auth writes, report flush) │ PriorityAuthRenewer │
//! ├─────────────────────────────────────────────────────────────┤
//! │                       flushd-kv                             │
//! │                     KvBackend trait                         │
//! │   (hashes, sets, rename, TTL, pub/sub, ping)                │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │   MemoryKv   │           server-backed backends             │
//! │   (testing)  │              (production)                    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use bytes::Bytes;
//! use flushd_kv::{KvBackend, MemoryKv};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let kv = MemoryKv::new();
//!
//! kv.hash_incr_by("report:a_service:user_key:alice", "hits", 5).await.unwrap();
//! let fields = kv.hash_get_all("report:a_service:user_key:alice").await.unwrap();
//! assert_eq!(fields, vec![("hits".to_owned(), Bytes::from("5"))]);
//! # });
//! ```
//!
//! # Error Handling
//!
//! All operations return [`KvResult<T>`]. Backends map their internal
//! errors to [`KvError`] variants; [`KvError::is_transient`] drives retry
//! decisions in the layers above.
//!
//! # Feature Flags
//!
//! - **`testutil`**: enables the `testutil` module with the [`FailingKv`]
//!   failure-injection wrapper. Enable this in `[dev-dependencies]` for
//!   integration tests.
//!
//! [`FailingKv`]: testutil::FailingKv

#![deny(unsafe_code)]

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

// Re-export primary types at crate root for convenience
pub use backend::{KvBackend, MessageSource, Subscription};
pub use error::{BoxError, KvError, KvResult};
pub use memory::MemoryKv;
