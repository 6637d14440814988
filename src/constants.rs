//! Global constants for PathLab networking and impairment defaults

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Default copy buffer size for shaped directions (16KB)
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Chunk size ceiling for bandwidth-limited copies (8KB)
pub const BANDWIDTH_CHUNK_SIZE: usize = 8 * 1024;

/// Read buffer size for the blackhole discard loop (4KB)
pub const DISCARD_BUFFER_SIZE: usize = 4096;

// ============================================================================
// TLS RECORD LIMITS
// ============================================================================

/// TLS record header size: content type (1) + legacy version (2) + length (2)
pub const TLS_RECORD_HEADER_SIZE: usize = 5;

/// Maximum legal TLS record payload length (2^14 plus expansion allowance)
pub const TLS_MAX_RECORD_LEN: usize = 16384 + 256;

/// TLS handshake header size: type (1) + 24-bit length (3)
pub const TLS_HANDSHAKE_HEADER_SIZE: usize = 4;

// ============================================================================
// IMPAIRMENT DEFAULTS
// ============================================================================

/// Default truncation threshold for the MTU blackhole profile (bytes)
pub const DEFAULT_THRESHOLD_BYTES: usize = 1300;

/// Default added latency for the latency profile (ms)
pub const DEFAULT_LATENCY_MS: u64 = 50;

/// Default jitter window for the latency profile (ms)
pub const DEFAULT_JITTER_MS: u64 = 10;

/// Default client-to-upstream bandwidth cap (kbit/s, ~1 Mbps)
pub const DEFAULT_BANDWIDTH_KBPS: u64 = 1000;

/// Default blackhole hold duration (seconds)
pub const DEFAULT_BLACKHOLE_SECONDS: u64 = 30;

/// Token bucket refill interval for bandwidth shaping
pub const BANDWIDTH_REFILL_INTERVAL_MS: u64 = 200;

/// Refill intervals per second (derived from the refill interval)
pub const BANDWIDTH_INTERVALS_PER_SEC: u64 = 1000 / BANDWIDTH_REFILL_INTERVAL_MS;

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Upstream dial timeout (seconds)
pub const DIAL_TIMEOUT_SECS: u64 = 5;

/// Default client I/O read timeout (seconds)
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default client I/O write timeout (seconds)
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;

/// Grace window for in-flight connections at shutdown (seconds)
pub const SHUTDOWN_GRACE_SECS: u64 = 3;

/// Delay between forwarding the ClientHello and aborting, for ABORT_AFTER_CH
pub const ABORT_SETTLE_MS: u64 = 5;

// ============================================================================
// RECEIPTS
// ============================================================================

/// Default receipt ring buffer capacity
pub const RECEIPT_RING_CAPACITY: usize = 256;

/// Per-subscriber channel depth for /receipts/stream
pub const RECEIPT_STREAM_BUFFER: usize = 64;

/// Ed25519 seed file size (raw bytes)
pub const ED25519_SEED_SIZE: usize = 32;
