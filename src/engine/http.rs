// ── VaultStream Engine: HTTP Retry & Backoff ───────────────────────────────
//
// Shared retry utilities used by the task queue, the push worker, adapters
// and the platform transports.
//
// Policy:
//   • Exponential backoff: base 1s, doubles per attempt, capped at 5 minutes
//   • ±20% jitter on every computed delay
//   • Retry on 429 (rate limit), 500, 502, 503, 504
//   • Respects `Retry-After` header (integer seconds)
//
// Workers that persist a retry (task queue, queue items) use the pure
// `backoff_delay_ms` to compute `next_attempt_at`; in-process retries use
// the sleeping `retry_delay`.

use std::time::{Duration, SystemTime};

use crate::atoms::constants::{RETRY_BASE_MS, RETRY_CAP_MS, RETRY_JITTER_FRACTION};

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Delay before attempt `attempt + 1`, in milliseconds, with jitter applied.
/// `attempt` is 0-based: the first retry waits ~1s, the second ~2s, …
pub fn backoff_delay_ms(attempt: u32) -> u64 {
    let base_ms = RETRY_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(20)));
    apply_jitter(base_ms.min(RETRY_CAP_MS))
}

/// Sleep with exponential backoff + jitter. Respects a server-provided
/// Retry-After value when it exceeds the computed backoff.
/// Returns the actual delay duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let computed_ms = backoff_delay_ms(attempt);
    let delay_ms = match retry_after_secs {
        // Use the server-specified delay, capped at 60s, floored at our backoff.
        Some(secs) => (secs.min(60) * 1000).max(computed_ms),
        None => computed_ms,
    };
    let delay = Duration::from_millis(delay_ms);
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ± jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms as f64 * RETRY_JITTER_FRACTION) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let offset = (rand_jitter() % (2 * jitter_range + 1)) - jitter_range;
    let result = base_ms as i64 + offset;
    result.max(100) as u64
}

/// Simple jitter source using system clock nanos (no extra crate needed).
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter is ±20%, so compare against loose bounds.
        let first = backoff_delay_ms(0);
        assert!((800..=1200).contains(&first), "attempt 0 → ~1s, got {first}");

        let tenth = backoff_delay_ms(10);
        assert!(tenth <= (RETRY_CAP_MS as f64 * 1.2) as u64, "cap respected, got {tenth}");

        // Absurd attempt numbers must not overflow.
        let huge = backoff_delay_ms(u32::MAX);
        assert!(huge <= (RETRY_CAP_MS as f64 * 1.2) as u64);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after(" 5 "), Some(5));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }
}
