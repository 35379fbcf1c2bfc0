//! Caching and authorization-renewal core of the flushd daemon.
//!
//! flushd sits between client-facing request handlers and a remote
//! rate-limiting authorization service. Handlers cannot afford an upstream
//! round trip per request, so the daemon keeps a shared KV cache of
//! per-application authorization decisions and a companion cache of usage
//! counters that are periodically flushed upstream.
//!
//! # Architecture
//!
//! ```text
//!  client handler ──publish──▶ auth_requests channel
//!        │                           │
//!        │ subscribe            ┌────▼────────────────┐
//!        │                      │ PriorityAuthRenewer │  dedup + bounded pool
//!        │                      └────┬───────────┬────┘
//!        │                           │           │
//!        │                     ┌─────▼─────┐ ┌───▼────────┐
//!        │                     │ Authorizer│ │  Storage   │
//!        │                     │ (upstream)│ │ (KV writes)│
//!        │                     └───────────┘ └───┬────────┘
//!        │                                       │
//!        ◀───────publish response────────────────┘  (cache first, then publish)
//! ```
//!
//! The periodic flusher (outside this crate) drives
//! [`Storage::reports_to_flush`] on a timer and reports the drained usage
//! upstream.
//!
//! # Components
//!
//! - [`Authorization`](auth::Authorization): allow / deny decisions and
//!   their stable cache encoding
//! - [`Credentials`](credentials::Credentials): opaque application
//!   credentials with a canonical escaped wire form
//! - [`keys`]: every KV key and channel name, derivable and parseable
//! - [`AuthRequest`](request::AuthRequest): the request-channel payload
//! - [`Authorizer`](authorizer::Authorizer): one upstream call expanded
//!   into a per-metric decision map with hierarchy-aware limit propagation
//! - [`Storage`](storage::Storage): batched auth cache writes and the
//!   snapshot-and-rename usage flush protocol
//! - [`PriorityAuthRenewer`](renewer::PriorityAuthRenewer): the pub/sub
//!   renewal worker

#![deny(unsafe_code)]

pub mod auth;
pub mod authorizer;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod renewer;
pub mod request;
pub mod storage;
pub mod upstream;

// Re-export primary types at crate root for convenience
pub use auth::{Authorization, LIMITS_EXCEEDED};
pub use authorizer::Authorizer;
pub use config::{FlushdConfig, KvConnConfig, RetryConfig, WorkerConfig};
pub use credentials::Credentials;
pub use error::{AuthorizeError, ConfigError, RenewAuthError, RenewerError};
pub use renewer::PriorityAuthRenewer;
pub use request::AuthRequest;
pub use storage::{BATCH, Report, Storage};
pub use upstream::{AuthResult, UpstreamClient, UpstreamError, UsageReport};
