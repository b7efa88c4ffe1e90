//! Object-cache core library.
//!
//! This crate implements the storage and streaming heart of an HTTP
//! reverse-proxy cache:
//! 1. **Objects:** The objcore record, the busy-object rendezvous between
//!    one fetcher and many deliverers, typed attributes and the object
//!    event bus.
//! 2. **Storage:** Pluggable stevedores (malloc, file, umem, debug,
//!    synth, persistent silo) with chunked allocation, LRU nuking and
//!    lease-based streaming iteration.
//! 3. **Backends:** Per-backend connection pools with saint-mode
//!    quarantine and a window-bitmap health probe engine.
//! 4. **Directors:** Simple, round-robin, random/hash/client and DNS
//!    selection policies.
//! 5. **HTTP policy:** Clock-skew tolerant TTL computation and body-mode
//!    classification.
//!
//! HTTP wire parsing, the configuration language, the cache index and
//! the ban list are external collaborators; this crate only carries
//! their interfaces.

/// Backend connection pooling and health probing.
pub mod backend;
/// Common helpers: errors, encoding, randomness, time.
pub mod common;
/// Tunable parameters with process-wide installation.
pub mod config;
/// Backend selection policies.
pub mod director;
/// Response view, HTTP dates, TTL and body classification.
pub mod http;
/// Objcore, busy objects, attributes, events.
pub mod obj;
/// Operational counters.
pub mod stats;
/// Storage stevedores.
pub mod storage;

/// Root configuration type; install once, read everywhere.
pub use crate::config::Config;
/// The cache entry record.
pub use crate::obj::ObjCore;
/// Per-thread worker context carrying statistics.
pub use crate::stats::Worker;
/// The storage engine contract.
pub use crate::storage::Stevedore;
