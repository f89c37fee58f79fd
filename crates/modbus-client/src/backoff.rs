use std::time::Duration;

use rand::Rng;

/// `delay = clamp(base * 2^min(attempt, 10), base, max)`, then jittered by a
/// uniform factor in `(1 - jitter, 1 + jitter)`, floored at zero.
pub fn compute_backoff(base: Duration, max: Duration, jitter: f64, attempt: u32) -> Duration {
    let exponent = attempt.min(10);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let scaled_nanos = (base.as_nanos() as u64).saturating_mul(multiplier);
    let clamped_nanos = scaled_nanos.clamp(base.as_nanos() as u64, max.as_nanos() as u64);

    let jitter_factor = if jitter <= 0.0 {
        1.0
    } else {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    };

    let jittered_nanos = (clamped_nanos as f64 * jitter_factor).max(0.0) as u64;
    Duration::from_nanos(jittered_nanos)
}
