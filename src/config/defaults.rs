//! System-wide default constants.
//!
//! Centralises the timing and sizing numbers used across the pipeline.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Delivery Worker
// ============================================================================

/// Delay between successive event pushes within one batch (seconds).
pub const PACING_DELAY_SECS: u64 = 120;

/// Default feed poll interval (seconds). `0` selects the coupled legacy cadence.
pub const POLL_INTERVAL_SECS: u64 = 300;

/// Outbound queue capacity (events).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Consecutive failed cycles tolerated before the worker gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// First retry delay after a failed cycle (seconds). Doubles per failure.
pub const BACKOFF_INITIAL_SECS: u64 = 5;

/// Retry delay cap (seconds).
pub const BACKOFF_MAX_SECS: u64 = 300;

// ============================================================================
// Feed
// ============================================================================

/// HTTP timeout for one feed request (seconds).
pub const FEED_REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// CoT
// ============================================================================

/// Default staleness window (seconds).
pub const COT_STALE_SECS: u32 = 300;

/// Default uid prefix.
pub const COT_UID_PREFIX: &str = "Garmin";

// ============================================================================
// TAK Connection
// ============================================================================

/// TAK server TLS streaming port.
pub const TAK_TLS_PORT: u16 = 8089;

/// TAK server plain TCP streaming port.
pub const TAK_TCP_PORT: u16 = 8087;

/// TAK server UDP input port.
pub const TAK_UDP_PORT: u16 = 8087;

/// Connect timeout for the pre-flight probe and the streaming transport (seconds).
pub const TAK_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum reconnection attempts per event before the sender gives up.
pub const TAK_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial reconnection delay (doubles each attempt).
pub const TAK_INITIAL_RECONNECT_DELAY_SECS: u64 = 2;

/// Maximum reconnection delay cap (seconds).
pub const TAK_MAX_RECONNECT_DELAY_SECS: u64 = 60;
