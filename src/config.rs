//! Node configuration.

use std::time::Duration;

use crate::routing::{DEFAULT_CACHE_SIZE, DEFAULT_MAX_FAILURES, MAX_BUCKET_SIZE_K};

/// Default per-request timeout before a peer counts as unresponsive.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default overall deadline for an iterative lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(8);

/// Default overall deadline for a store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of lookup requests kept in flight at once.
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Debug, Clone)]
/// Node configuration; [Default] matches the standard protocol parameters.
pub struct Config {
    /// Bucket capacity and replication factor (k).
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K].
    pub k: usize,
    /// Lookup parallelism (alpha).
    ///
    /// Defaults to [DEFAULT_ALPHA].
    pub alpha: usize,
    /// Timeout for a single request to a single peer.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Overall deadline for an iterative lookup.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT].
    pub lookup_timeout: Duration,
    /// Overall deadline for a store operation.
    ///
    /// Defaults to [DEFAULT_STORE_TIMEOUT].
    pub store_timeout: Duration,
    /// Capacity of each bucket's replacement cache.
    ///
    /// Defaults to [DEFAULT_CACHE_SIZE].
    pub cache_size: usize,
    /// Consecutive failures before a contact is evicted from its bucket.
    ///
    /// Defaults to [DEFAULT_MAX_FAILURES].
    pub max_contact_failures: usize,
    /// Replicate stored values to newly sighted nodes.
    ///
    /// Defaults to `true`.
    pub store_forward: bool,
    /// Port to bind the UDP transport to; `None` picks any available port.
    pub port: Option<u16>,
    /// Addresses of known nodes to populate the routing table from.
    pub bootstrap: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cache_size: DEFAULT_CACHE_SIZE,
            max_contact_failures: DEFAULT_MAX_FAILURES,
            store_forward: true,
            port: None,
            bootstrap: Vec::new(),
        }
    }
}
