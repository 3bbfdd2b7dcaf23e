//! ID utilities: monotonic command ids, timestamps and request ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new monotonic identifier (starts at 1).
pub fn next_monotonic_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Milliseconds since UNIX epoch (for timestamps).
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Opaque 128-bit request identifier (UUID v4 string).
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Command id for one dispatched action: `cmd-<n>` within this process.
pub fn new_command_id() -> String {
    format!("cmd-{}", next_monotonic_id())
}
