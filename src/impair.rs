//! Impairment profiles and process-wide impairment state
//!
//! The active [`ImpairConfig`] is process-wide: it is replaced wholesale by
//! the admin API and snapshotted on every accept. Writers are rare, readers
//! are hot, so the config sits behind a readers-writer lock. Lock poisoning
//! indicates a panic in another thread, which is unrecoverable.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{
    DEFAULT_BANDWIDTH_KBPS, DEFAULT_BLACKHOLE_SECONDS, DEFAULT_JITTER_MS, DEFAULT_LATENCY_MS,
    DEFAULT_THRESHOLD_BYTES,
};

/// Impairment profile selector. Unknown wire names fall back to `Clean`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Clean,
    AbortAfterCh,
    MtuBlackhole,
    LatencyJitter,
    BandwidthLimit,
}

impl Profile {
    /// Canonical wire name of the profile.
    pub const fn as_str(self) -> &'static str {
        match self {
            Profile::Clean => "CLEAN",
            Profile::AbortAfterCh => "ABORT_AFTER_CH",
            Profile::MtuBlackhole => "MTU1300_BLACKHOLE",
            Profile::LatencyJitter => "LATENCY_50MS_JITTER_10",
            Profile::BandwidthLimit => "BANDWIDTH_1MBPS",
        }
    }

    /// Resolve a wire name, case-insensitively. Unknown or empty names fall
    /// back to `Clean`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "ABORT_AFTER_CH" => Profile::AbortAfterCh,
            "MTU1300_BLACKHOLE" => Profile::MtuBlackhole,
            "LATENCY_50MS_JITTER_10" => Profile::LatencyJitter,
            "BANDWIDTH_1MBPS" => Profile::BandwidthLimit,
            _ => Profile::Clean,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Profile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Profile::from_name(&name))
    }
}

/// Full impairment configuration as applied through the admin API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpairConfig {
    #[serde(default)]
    pub profile: Profile,
    /// Truncation threshold for MTU1300_BLACKHOLE (bytes).
    #[serde(default)]
    pub threshold_bytes: usize,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    /// Client-to-upstream cap (kbit/s).
    #[serde(default)]
    pub bandwidth_kbps: u64,
    /// Upstream-to-client cap (kbit/s); zero leaves that direction unshaped.
    #[serde(default)]
    pub bandwidth_down_kbps: u64,
    #[serde(default)]
    pub blackhole_seconds: u64,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ImpairConfig {
    /// Fill in profile-dependent defaults for zeroed fields.
    fn normalized(mut self) -> Self {
        if self.threshold_bytes == 0 {
            self.threshold_bytes = DEFAULT_THRESHOLD_BYTES;
        }
        if self.profile == Profile::LatencyJitter {
            if self.latency_ms == 0 {
                self.latency_ms = DEFAULT_LATENCY_MS;
            }
            if self.jitter_ms == 0 {
                self.jitter_ms = DEFAULT_JITTER_MS;
            }
        }
        if self.profile == Profile::BandwidthLimit && self.bandwidth_kbps == 0 {
            self.bandwidth_kbps = DEFAULT_BANDWIDTH_KBPS;
        }
        if self.blackhole_seconds == 0 {
            self.blackhole_seconds = DEFAULT_BLACKHOLE_SECONDS;
        }
        self
    }
}

/// Thread-safe holder for the globally active impairment config.
#[derive(Debug, Default)]
pub struct ImpairState {
    curr: RwLock<ImpairConfig>,
}

impl ImpairState {
    /// Create a state holding the normalized default (CLEAN) config.
    pub fn new() -> Self {
        let state = Self::default();
        state.apply(ImpairConfig::default());
        state
    }

    /// Normalize defaults, stamp `updated_at` and replace the stored config.
    /// Returns the config as applied.
    pub fn apply(&self, cfg: ImpairConfig) -> ImpairConfig {
        let mut cfg = cfg.normalized();
        cfg.updated_at = Some(Utc::now());
        let mut curr = self.curr.write().expect("impair state lock poisoned");
        *curr = cfg.clone();
        cfg
    }

    /// Copy of the currently active config. Never observes a half-applied
    /// update.
    pub fn snapshot(&self) -> ImpairConfig {
        self.curr.read().expect("impair state lock poisoned").clone()
    }
}
