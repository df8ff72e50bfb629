//! Time-window folding policy.
//!
//! A message older than the 180-second window is "stale": the client
//! collapses it out of the visible transcript, and the transfer
//! coordinator excludes it from the context copied to the human agent.
//! Both sides MUST share this one implementation — if the comparisons
//! diverge, the agent sees context the user had already seen folded.

/// Width of the freshness window in milliseconds.
pub const FRESH_WINDOW_MS: i64 = 180_000;

/// Whether a message is stale at `now_ms`.
///
/// A message exactly on the boundary (180 000 ms old) is still fresh.
pub fn is_stale(created_at_ms: i64, now_ms: i64) -> bool {
    now_ms - created_at_ms > FRESH_WINDOW_MS
}

/// Start of the freshness window ending at `window_end_ms`.
pub fn window_start(window_end_ms: i64) -> i64 {
    window_end_ms - FRESH_WINDOW_MS
}
