//! Configuration for the cache core.
//!
//! This module defines the tunable parameters of the object cache. It
//! provides:
//! 1. **Defaults:** Baseline constants (chunk sizes, timeouts, probe window).
//! 2. **Structures:** Hierarchical config for fetch/storage, backend and
//!    probe behavior.
//! 3. **Process-wide access:** A read-only installed configuration, set once
//!    at startup by the management side and consulted everywhere else.
//!
//! Configuration is supplied as JSON (operator tooling) or via
//! `Config::default()` for embedded use.

use std::sync::OnceLock;

use serde::Deserialize;

/// Default configuration constants.
///
/// These values define the baseline behavior when not explicitly
/// overridden in the configuration document.
mod defaults {
    /// Default body chunk size requested from a stevedore (16 KiB).
    ///
    /// Used when a fetch asks for space without a size hint.
    pub const FETCH_CHUNKSIZE: usize = 16 * 1024;

    /// Upper bound on a single body chunk (16 MiB).
    ///
    /// Larger space hints are clamped; the progressive-halving allocation
    /// fallback starts from this bound.
    pub const FETCH_MAXCHUNKSIZE: usize = 16 * 1024 * 1024;

    /// Default transit buffer (0 = no fetcher throttling).
    pub const TRANSIT_BUFFER: u64 = 0;

    /// Default TTL assigned when the response specifies nothing (seconds).
    pub const DEFAULT_TTL: f64 = 120.0;

    /// Maximum tolerated clock skew between backend and cache (seconds).
    pub const CLOCK_SKEW: f64 = 10.0;

    /// Minimum interval between LRU timestamp updates for one object
    /// (seconds). Touches inside the window are ignored.
    pub const LRU_INTERVAL: f64 = 2.0;

    /// Backend connect timeout (seconds). Non-positive means a blocking
    /// connect.
    pub const CONNECT_TIMEOUT: f64 = 3.5;

    /// Timeout for the first body byte from a backend (seconds).
    pub const FIRST_BYTE_TIMEOUT: f64 = 60.0;

    /// Timeout between body bytes from a backend (seconds).
    pub const BETWEEN_BYTES_TIMEOUT: f64 = 60.0;

    /// Saint-mode threshold: trouble entries tolerated per backend before
    /// it is considered sick for every object. 0 disables saint mode.
    pub const SAINTMODE_THRESHOLD: u32 = 10;

    /// Probe timeout (seconds).
    pub const PROBE_TIMEOUT: f64 = 2.0;

    /// Probe interval (seconds).
    pub const PROBE_INTERVAL: f64 = 5.0;

    /// Probe window: number of recent polls considered.
    pub const PROBE_WINDOW: u32 = 8;

    /// Probe threshold: good polls within the window required for healthy.
    pub const PROBE_THRESHOLD: u32 = 3;

    /// Expected probe response status.
    pub const PROBE_EXP_STATUS: u16 = 200;
}

/// Root configuration for the cache core.
///
/// # Examples
///
/// ```
/// use objcache_core::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.params.fetch_chunksize, 16 * 1024);
/// assert_eq!(config.probe.window, 8);
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use objcache_core::config::Config;
///
/// let json = r#"{
///     "params": { "fetch_chunksize": 4096, "default_ttl": 60.0 },
///     "backend": { "prefer_ipv6": true },
///     "probe": { "window": 16, "threshold": 8 }
/// }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.params.fetch_chunksize, 4096);
/// assert!(config.backend.prefer_ipv6);
/// assert_eq!(config.probe.window, 16);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Fetch, storage and expiry tunables.
    #[serde(default)]
    pub params: CacheParams,
    /// Backend connection handling.
    #[serde(default)]
    pub backend: BackendParams,
    /// Default probe spec values.
    #[serde(default)]
    pub probe: ProbeParams,
}

static INSTALLED: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Installs this configuration process-wide.
    ///
    /// May only be called once, before worker threads start; later calls
    /// return `false` and leave the original configuration in place.
    pub fn install(self) -> bool {
        INSTALLED.set(self).is_ok()
    }

    /// Returns the installed configuration, or the defaults if none was
    /// installed.
    pub fn get() -> &'static Config {
        INSTALLED.get_or_init(Config::default)
    }
}

/// Fetch, storage and expiry tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheParams {
    /// Body chunk size used when a fetch gives no size hint.
    #[serde(default = "CacheParams::default_chunksize")]
    pub fetch_chunksize: usize,

    /// Upper bound on a single body chunk.
    #[serde(default = "CacheParams::default_maxchunksize")]
    pub fetch_maxchunksize: usize,

    /// Transit buffer applied to new busy objects (bytes, 0 = off).
    #[serde(default)]
    pub transit_buffer: u64,

    /// TTL when the response carries no caching information (seconds).
    #[serde(default = "CacheParams::default_ttl")]
    pub default_ttl: f64,

    /// Tolerated backend/cache clock skew (seconds).
    #[serde(default = "CacheParams::default_clock_skew")]
    pub clock_skew: f64,

    /// Minimum interval between LRU updates for one object (seconds).
    #[serde(default = "CacheParams::default_lru_interval")]
    pub lru_interval: f64,
}

impl CacheParams {
    /// Returns the default fetch chunk size.
    fn default_chunksize() -> usize {
        defaults::FETCH_CHUNKSIZE
    }

    /// Returns the default maximum chunk size.
    fn default_maxchunksize() -> usize {
        defaults::FETCH_MAXCHUNKSIZE
    }

    /// Returns the default TTL.
    fn default_ttl() -> f64 {
        defaults::DEFAULT_TTL
    }

    /// Returns the default clock skew tolerance.
    fn default_clock_skew() -> f64 {
        defaults::CLOCK_SKEW
    }

    /// Returns the default LRU touch interval.
    fn default_lru_interval() -> f64 {
        defaults::LRU_INTERVAL
    }
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            fetch_chunksize: defaults::FETCH_CHUNKSIZE,
            fetch_maxchunksize: defaults::FETCH_MAXCHUNKSIZE,
            transit_buffer: defaults::TRANSIT_BUFFER,
            default_ttl: defaults::DEFAULT_TTL,
            clock_skew: defaults::CLOCK_SKEW,
            lru_interval: defaults::LRU_INTERVAL,
        }
    }
}

/// Backend connection handling parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendParams {
    /// Connect timeout (seconds); non-positive means a blocking connect.
    #[serde(default = "BackendParams::default_connect_timeout")]
    pub connect_timeout: f64,

    /// First-byte timeout fallback (seconds).
    #[serde(default = "BackendParams::default_first_byte_timeout")]
    pub first_byte_timeout: f64,

    /// Between-bytes timeout fallback (seconds).
    #[serde(default = "BackendParams::default_between_bytes_timeout")]
    pub between_bytes_timeout: f64,

    /// Trouble entries tolerated before saint mode declares a backend
    /// sick for all objects. 0 disables saint mode.
    #[serde(default = "BackendParams::default_saintmode_threshold")]
    pub saintmode_threshold: u32,

    /// Attempt IPv6 addresses before IPv4.
    #[serde(default)]
    pub prefer_ipv6: bool,
}

impl BackendParams {
    /// Returns the default connect timeout.
    fn default_connect_timeout() -> f64 {
        defaults::CONNECT_TIMEOUT
    }

    /// Returns the default first-byte timeout.
    fn default_first_byte_timeout() -> f64 {
        defaults::FIRST_BYTE_TIMEOUT
    }

    /// Returns the default between-bytes timeout.
    fn default_between_bytes_timeout() -> f64 {
        defaults::BETWEEN_BYTES_TIMEOUT
    }

    /// Returns the default saint-mode threshold.
    fn default_saintmode_threshold() -> u32 {
        defaults::SAINTMODE_THRESHOLD
    }
}

impl Default for BackendParams {
    fn default() -> Self {
        Self {
            connect_timeout: defaults::CONNECT_TIMEOUT,
            first_byte_timeout: defaults::FIRST_BYTE_TIMEOUT,
            between_bytes_timeout: defaults::BETWEEN_BYTES_TIMEOUT,
            saintmode_threshold: defaults::SAINTMODE_THRESHOLD,
            prefer_ipv6: false,
        }
    }
}

/// Default probe spec values, applied when a probe leaves fields unset.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeParams {
    /// Probe timeout (seconds).
    #[serde(default = "ProbeParams::default_timeout")]
    pub timeout: f64,

    /// Probe interval (seconds).
    #[serde(default = "ProbeParams::default_interval")]
    pub interval: f64,

    /// Window of recent polls considered (at most 64).
    #[serde(default = "ProbeParams::default_window")]
    pub window: u32,

    /// Good polls within the window required for healthy.
    #[serde(default = "ProbeParams::default_threshold")]
    pub threshold: u32,

    /// Expected HTTP status of a good probe response.
    #[serde(default = "ProbeParams::default_exp_status")]
    pub exp_status: u16,
}

impl ProbeParams {
    /// Returns the default probe timeout.
    fn default_timeout() -> f64 {
        defaults::PROBE_TIMEOUT
    }

    /// Returns the default probe interval.
    fn default_interval() -> f64 {
        defaults::PROBE_INTERVAL
    }

    /// Returns the default probe window.
    fn default_window() -> u32 {
        defaults::PROBE_WINDOW
    }

    /// Returns the default probe threshold.
    fn default_threshold() -> u32 {
        defaults::PROBE_THRESHOLD
    }

    /// Returns the default expected status.
    fn default_exp_status() -> u16 {
        defaults::PROBE_EXP_STATUS
    }
}

impl Default for ProbeParams {
    fn default() -> Self {
        Self {
            timeout: defaults::PROBE_TIMEOUT,
            interval: defaults::PROBE_INTERVAL,
            window: defaults::PROBE_WINDOW,
            threshold: defaults::PROBE_THRESHOLD,
            exp_status: defaults::PROBE_EXP_STATUS,
        }
    }
}
