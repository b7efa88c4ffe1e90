//! Error taxonomy for the cache core.
//!
//! Each subsystem reports failure through its own enum so callers can match
//! on the recovery policy that applies:
//! 1. **AllocError:** storage is full; local recovery via LRU nuking.
//! 2. **VaiError:** async iteration flow control and fetch failure.
//! 3. **SiloError:** persistent silo open/validate problems.
//! 4. **ConnectError:** backend connection establishment failures.

use std::io;

use thiserror::Error;

/// Storage allocation failures.
///
/// Allocation failures are local: the caller is expected to loop through
/// LRU eviction once and retry before surfacing this error.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The stevedore's configured byte cap (or backing store) is exhausted.
    #[error("storage full")]
    Full,
    /// The requested size can never be satisfied by this stevedore.
    #[error("allocation of {0} bytes exceeds stevedore limits")]
    TooBig(usize),
}

/// Flow-control results from the async iteration (VAI) lease functions.
///
/// These mirror the errno-style contract of the lease call: `Again` and
/// `NoBufs` mean a notification will fire when progress is possible,
/// `Pipe` is the deliverer's view of a failed fetch.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum VaiError {
    /// Nothing available right now; storage will notify.
    #[error("no data available yet")]
    Again,
    /// The caller must return leases before more can be produced.
    #[error("lease budget exhausted, return leases first")]
    NoBufs,
    /// The fetch failed; the body will never complete.
    #[error("fetch failed")]
    Pipe,
    /// A buffer request had an invalid size.
    #[error("invalid buffer request")]
    Inval,
}

/// Object delivery failures surfaced by the body iterator.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum DeliverError {
    /// The delivery callback asked to stop.
    #[error("delivery aborted by consumer")]
    Aborted,
    /// The fetch feeding this delivery failed.
    #[error("fetch failed while streaming")]
    FetchFailed,
}

/// Persistent silo open / validation failures.
#[derive(Debug, Error)]
pub enum SiloError {
    /// Underlying file I/O failed.
    #[error("silo i/o: {0}")]
    Io(#[from] io::Error),
    /// The identification block did not validate.
    #[error("silo ident invalid (reason {0})")]
    BadIdent(u32),
    /// Neither copy of a double-buffered signed region validated.
    #[error("both {0} slots corrupt")]
    BothSlotsBad(&'static str),
    /// The silo is smaller than the minimum usable geometry.
    #[error("silo too small: {0} bytes")]
    TooSmall(u64),
    /// mmap of the silo file failed.
    #[error("silo mmap failed: {0}")]
    Mmap(io::Error),
}

/// Backend connection establishment failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The backend is administratively or probe-wise sick.
    #[error("backend unhealthy")]
    Unhealthy,
    /// Saint mode has quarantined this object on this backend.
    #[error("backend in saint mode for this object")]
    SaintMode,
    /// The per-backend connection limit was reached.
    #[error("backend connection limit reached")]
    Busy,
    /// All addresses failed to connect.
    #[error("connect failed: {0}")]
    Failed(io::Error),
    /// The backend has no usable address.
    #[error("backend has no address")]
    NoAddress,
}

/// Stevedore configuration errors (argument parsing, init).
#[derive(Debug, Error)]
pub enum StorageArgError {
    /// The `-s` style specification could not be parsed.
    #[error("storage spec: {0}")]
    Spec(String),
    /// A stevedore ident was defined twice.
    #[error("storage ident {0:?} already defined")]
    DuplicateIdent(String),
    /// The stevedore failed to initialize its backing store.
    #[error("storage init: {0}")]
    Init(String),
    /// Underlying file I/O failed during init.
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
}
