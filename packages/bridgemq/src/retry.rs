//! Retry policy: eligibility classification and backoff computation.
//!
//! Eligibility is separate from scheduling. A failure is retry-eligible iff
//! its code is outside the non-retryable set and the error record does not
//! carry an explicit `retryable = false`. Scheduling (delay computation and
//! the DLQ cutoff) lives in `retry_job.lua`; the formulas here are the same
//! ones, mirrored for producers and tests.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// Invalid payload; never retried.
pub const CODE_INVALID_PAYLOAD: u16 = 1001;
/// Invalid config; never retried.
pub const CODE_INVALID_CONFIG: u16 = 1002;
/// Handler body returned an error; retryable by default.
pub const CODE_HANDLER_FAILURE: u16 = 3002;
/// Worker capability mismatch; never retried.
pub const CODE_CAPABILITY_MISMATCH: u16 = 3003;

/// Backoff family, resolved once at create time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// One entry of a job's error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorRecord {
    pub code: u16,
    pub message: String,
    /// Explicit override; `Some(false)` forces terminal failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Millisecond timestamp of the failure.
    pub at: i64,
}

impl JobErrorRecord {
    pub fn new(code: u16, message: impl Into<String>, at: i64) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
            at,
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = Some(false);
        self
    }

    /// Capture a handler-body failure, cause chain included.
    ///
    /// `anyhow` never crosses the store boundary; it is flattened into a
    /// record here and classified as a plain handler failure (retryable
    /// unless the retry config says otherwise).
    pub fn from_anyhow(error: &anyhow::Error, at: i64) -> Self {
        Self::new(CODE_HANDLER_FAILURE, format!("{error:#}"), at)
    }
}

/// Whether this failure may go back through the retry script.
pub fn is_retry_eligible(error: &JobErrorRecord) -> bool {
    if error.retryable == Some(false) {
        return false;
    }
    !matches!(
        error.code,
        CODE_INVALID_PAYLOAD | CODE_INVALID_CONFIG | CODE_CAPABILITY_MISMATCH
    )
}

/// Pre-jitter delay before attempt `attempt + 1`, in milliseconds.
///
/// `attempt` is the value AFTER the increment in the retry script, so the
/// first failure computes with `attempt = 1`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    let raw = match config.backoff {
        BackoffKind::Exponential => {
            let shift = (attempt - 1).min(63);
            config.base_delay_ms.saturating_mul(1u64 << shift)
        }
        BackoffKind::Linear => config.base_delay_ms.saturating_mul(attempt as u64),
        BackoffKind::Fixed => config.base_delay_ms,
    };
    raw.min(config.max_delay_ms)
}

/// Apply uniform jitter of `±jitter_factor` to a delay, flooring to integer
/// milliseconds. `unit` must be in `[-1, 1]`.
pub fn apply_jitter(delay_ms: u64, jitter_factor: f64, unit: f64) -> u64 {
    let unit = unit.clamp(-1.0, 1.0);
    let factor = 1.0 + jitter_factor * unit;
    (delay_ms as f64 * factor).floor().max(0.0) as u64
}

/// Draw a jitter unit in `[-1, 1]` from the thread RNG.
///
/// Randomness stays caller-side; the retry script receives the drawn unit
/// so its arithmetic is deterministic.
pub fn draw_jitter_unit() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence() {
        // P6: base 1000, max 60000 → 1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000.
        let config = RetryConfig::default();
        let produced: Vec<u64> = (1..=8).map(|a| compute_delay(&config, a)).collect();
        assert_eq!(
            produced,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
    }

    #[test]
    fn test_linear_and_fixed() {
        let mut config = RetryConfig {
            backoff: BackoffKind::Linear,
            base_delay_ms: 500,
            max_delay_ms: 1_800,
            ..Default::default()
        };
        assert_eq!(compute_delay(&config, 1), 500);
        assert_eq!(compute_delay(&config, 3), 1_500);
        assert_eq!(compute_delay(&config, 4), 1_800);

        config.backoff = BackoffKind::Fixed;
        assert_eq!(compute_delay(&config, 1), 500);
        assert_eq!(compute_delay(&config, 9), 500);
    }

    #[test]
    fn test_exponential_never_overflows() {
        let config = RetryConfig {
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
            ..Default::default()
        };
        // Shift saturates instead of panicking.
        let _ = compute_delay(&config, 200);
    }

    #[test]
    fn test_jitter_bounds() {
        for &unit in &[-1.0, -0.5, 0.0, 0.5, 1.0] {
            let jittered = apply_jitter(1_000, 0.2, unit);
            assert!((800..=1_200).contains(&jittered), "unit {unit} -> {jittered}");
        }
        // Out-of-range units are clamped.
        assert_eq!(apply_jitter(1_000, 0.2, 7.0), 1_200);
        assert_eq!(apply_jitter(1_000, 0.2, -7.0), 800);
    }

    #[test]
    fn test_drawn_jitter_stays_in_band() {
        let config = RetryConfig::default();
        for _ in 0..256 {
            let unit = draw_jitter_unit();
            let jittered = apply_jitter(compute_delay(&config, 1), config.jitter_factor, unit);
            assert!((800..=1_200).contains(&jittered));
        }
    }

    #[test]
    fn test_jitter_band_holds_for_random_delays_and_factors() {
        fastrand::seed(7);
        for _ in 0..512 {
            let delay = fastrand::u64(1..=120_000);
            let factor = fastrand::f64();
            let unit = fastrand::f64() * 2.0 - 1.0;
            let jittered = apply_jitter(delay, factor, unit) as f64;
            // floor() may land one below the real-valued band edge
            assert!(jittered >= (delay as f64 * (1.0 - factor)) - 1.0);
            assert!(jittered <= delay as f64 * (1.0 + factor));
        }
    }

    #[test]
    fn test_from_anyhow_keeps_the_cause_chain() {
        let root = anyhow::anyhow!("connection refused");
        let wrapped = root.context("uploading artifact");
        let record = JobErrorRecord::from_anyhow(&wrapped, 42);
        assert_eq!(record.code, CODE_HANDLER_FAILURE);
        assert_eq!(record.at, 42);
        assert!(record.message.contains("uploading artifact"));
        assert!(record.message.contains("connection refused"));
        assert!(is_retry_eligible(&record));
    }

    #[test]
    fn test_eligibility_code_set() {
        assert!(!is_retry_eligible(&JobErrorRecord::new(CODE_INVALID_PAYLOAD, "bad", 0)));
        assert!(!is_retry_eligible(&JobErrorRecord::new(CODE_INVALID_CONFIG, "bad", 0)));
        assert!(!is_retry_eligible(&JobErrorRecord::new(
            CODE_CAPABILITY_MISMATCH,
            "bad",
            0
        )));
        assert!(is_retry_eligible(&JobErrorRecord::new(9001, "redis down", 0)));
        assert!(is_retry_eligible(&JobErrorRecord::new(4242, "handler bug", 0)));
    }

    #[test]
    fn test_explicit_retryable_false_wins() {
        let record = JobErrorRecord::new(9001, "fatal", 0).non_retryable();
        assert!(!is_retry_eligible(&record));
    }

    #[test]
    fn test_backoff_kind_serde() {
        assert_eq!(serde_json::to_string(&BackoffKind::Exponential).unwrap(), r#""exponential""#);
        let kind: BackoffKind = serde_json::from_str(r#""linear""#).unwrap();
        assert_eq!(kind, BackoffKind::Linear);
    }
}
