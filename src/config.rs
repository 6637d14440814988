//! Runtime settings for the PathLab proxy
//!
//! Collected once at startup from flags and environment, then shared
//! read-only across the accept loop and the admin API.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_READ_TIMEOUT_SECS, DEFAULT_WRITE_TIMEOUT_SECS, RECEIPT_RING_CAPACITY,
};

/// Immutable process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// TCP listen address for the proxy; clients connect here.
    pub listen: String,
    /// Upstream host:port dialed for every proxied connection.
    pub upstream: String,
    /// Admin HTTP API address.
    pub admin: String,
    /// Initial per-connection read deadline.
    pub read_timeout: Duration,
    /// Initial per-connection write deadline.
    pub write_timeout: Duration,
    /// Path to the Ed25519 seed file (created if missing).
    pub keyfile: PathBuf,
    /// Receipt ring buffer capacity.
    pub receipt_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10443".to_string(),
            upstream: "127.0.0.1:8443".to_string(),
            admin: "0.0.0.0:8080".to_string(),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            keyfile: PathBuf::from("pathlab-ed25519.key"),
            receipt_capacity: RECEIPT_RING_CAPACITY,
        }
    }
}
