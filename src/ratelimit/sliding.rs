//! Hybrid sliding window admission.
//!
//! A true sliding window needs a timestamp per request. Instead, each limit
//! keeps one counter per fixed window and weights the previous window by the
//! share of it that still overlaps the sliding window ending at `now`:
//!
//! ```text
//! elapsed  = (now - window_start) / duration
//! estimate = current + previous * (1 - elapsed)
//! allowed  = estimate + cost <= limit
//! ```

/// Start of the fixed window containing `now_ms`.
pub fn window_start(now_ms: u64, duration_ms: u64) -> u64 {
    debug_assert!(duration_ms > 0);
    now_ms - now_ms % duration_ms
}

/// Outcome of evaluating one limit against its window counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether `cost` fits under the limit
    pub allowed: bool,
    /// Weighted request count before this call
    pub estimate: f64,
    /// Headroom before this call
    pub remaining: u64,
    /// End of the current window (unix ms)
    pub reset: u64,
}

impl Admission {
    /// Headroom after `cost` is consumed.
    pub fn remaining_after(&self, limit: u32, cost: u64) -> u64 {
        headroom(limit, self.estimate + cost as f64)
    }
}

/// Weighted request count over the sliding window ending at `now_ms`.
pub fn estimate(current: u64, previous: u64, now_ms: u64, window_start: u64, duration_ms: u64) -> f64 {
    let elapsed = now_ms.saturating_sub(window_start) as f64 / duration_ms as f64;
    let weight = (1.0 - elapsed).clamp(0.0, 1.0);
    current as f64 + previous as f64 * weight
}

/// Decide whether `cost` more requests fit under `limit`.
///
/// A zero cost is always allowed; it is how callers read the remaining
/// quota without consuming any.
pub fn evaluate(
    limit: u32,
    duration_ms: u64,
    now_ms: u64,
    current: u64,
    previous: u64,
    cost: u64,
) -> Admission {
    let start = window_start(now_ms, duration_ms);
    let estimate = estimate(current, previous, now_ms, start, duration_ms);
    let allowed = cost == 0 || estimate + cost as f64 <= limit as f64;

    Admission {
        allowed,
        estimate,
        remaining: headroom(limit, estimate),
        reset: start + duration_ms,
    }
}

fn headroom(limit: u32, used: f64) -> u64 {
    (limit as f64 - used).max(0.0).floor() as u64
}
