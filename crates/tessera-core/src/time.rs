//! Monotonic millisecond clock for key expiry.

use std::sync::OnceLock;
use std::time::Instant;

/// Expiry value for keys that never expire.
pub const NO_EXPIRY: u64 = 0;

/// Milliseconds since the clock was first read in this process.
#[inline]
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    // start at 1 so a live deadline can never collide with NO_EXPIRY
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64 + 1
}

/// Absolute deadline `ttl_ms` from now.
#[inline]
pub fn deadline_after(ttl_ms: u64) -> u64 {
    now_ms().saturating_add(ttl_ms)
}

#[inline]
pub fn is_past(deadline: u64) -> bool {
    deadline != NO_EXPIRY && now_ms() >= deadline
}

/// Milliseconds left before `deadline`, or `None` if the key has no expiry.
#[inline]
pub fn ms_until(deadline: u64) -> Option<u64> {
    (deadline != NO_EXPIRY).then(|| deadline.saturating_sub(now_ms()))
}
