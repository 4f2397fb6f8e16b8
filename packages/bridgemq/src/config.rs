//! Enumerated job configuration.
//!
//! The original option bag is closed into typed sections. Everything here
//! serializes as camelCase JSON because the config blob is read back by the
//! server-side scripts (`config.retry.maxAttempts`, `config.target.mode`,
//! …), so the serde names ARE the storage contract.
//!
//! Validation is fail-fast at creation: job type pattern, priority range,
//! and mutually-exclusive schedule fields are rejected with 1xxx codes
//! before anything touches the store.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::BackoffKind;
use crate::routing::TargetSelector;

/// Default priority for jobs that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Idempotency/fingerprint index TTL when none is configured, in seconds.
pub const DEFAULT_DEDUP_WINDOW_SECS: u64 = 3600;

/// Behavior configuration attached to a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    /// Priority 1–10; higher claims sooner.
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "ScheduleConfig::is_empty")]
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    #[serde(skip_serializing_if = "TargetSelector::is_empty")]
    pub target: TargetSelector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<IdempotencyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleConfig>,
    pub behavior: BehaviorConfig,
    #[serde(skip_serializing_if = "ChainConfig::is_empty")]
    pub chain: ChainConfig,
    #[serde(skip_serializing_if = "DependenciesConfig::is_empty")]
    pub dependencies: DependenciesConfig,
}

/// Scheduling options. `delay` and `run_at` are mutually exclusive; cron
/// strings are interpreted outside the core and only the resulting
/// `scheduledFor` matters here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    /// Delay from now, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    /// Absolute run time, ms timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone name, carried opaquely for the external cron layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ScheduleConfig {
    pub fn is_empty(&self) -> bool {
        self.delay.is_none() && self.run_at.is_none() && self.cron.is_none() && self.timezone.is_none()
    }
}

/// Retry behavior. Defaults match the retry script: 3 attempts, exponential
/// backoff from 1 s capped at 60 s, ±20% jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub enabled: bool,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            enabled: true,
            jitter_factor: 0.2,
        }
    }
}

/// Fixed-window rate limiting for a job type (or any shared bucket key).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub key: String,
    pub max: u32,
    pub window_seconds: u32,
    /// Claim-time cap on concurrently-executing jobs in this bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub key: String,
    /// Index TTL in seconds.
    #[serde(default = "default_dedup_window")]
    pub window: u64,
}

fn default_dedup_window() -> u64 {
    DEFAULT_DEDUP_WINDOW_SECS
}

/// TTL applied to the meta/config/payload/result keys, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorConfig {
    /// Delete all job sub-keys when the job completes successfully.
    pub remove_on_complete: bool,
    /// Enable fingerprint-based dedup over `(type, payload)`.
    pub deduplication: bool,
}

/// Successor templates appended by the complete script; actual creation is
/// client-side (the worker drains the staged chain list).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<JobTemplate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<JobTemplate>,
}

impl ChainConfig {
    pub fn is_empty(&self) -> bool {
        self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

/// A job to create when a chain fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub config: Box<JobConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DependenciesConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<String>,
}

impl DependenciesConfig {
    pub fn is_empty(&self) -> bool {
        self.wait_for.is_empty()
    }
}

impl JobConfig {
    /// Effective priority, clamped defaults applied by [`validate`].
    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Resolve the absolute `scheduledFor` timestamp for a job created now.
    ///
    /// Returns `now` when no scheduling is configured. Errors when both
    /// `delay` and `runAt` are present.
    pub fn resolve_scheduled_for(&self, now_ms: i64) -> Result<i64> {
        match (self.schedule.delay, self.schedule.run_at) {
            (Some(_), Some(_)) => Err(Error::InvalidConfig(
                "schedule.delay and schedule.runAt are mutually exclusive".to_string(),
            )),
            (Some(delay), None) if delay < 0 => {
                Err(Error::InvalidConfig("schedule.delay must be non-negative".to_string()))
            }
            (Some(delay), None) => Ok(now_ms + delay),
            (None, Some(run_at)) => Ok(run_at),
            (None, None) => Ok(now_ms),
        }
    }

    /// Fail-fast validation of everything the store would otherwise accept
    /// silently.
    pub fn validate(&self) -> Result<()> {
        if let Some(priority) = self.priority {
            if !(1..=10).contains(&priority) {
                return Err(Error::InvalidConfig(format!(
                    "priority must be in 1..=10, got {priority}"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::InvalidConfig(
                "retry.jitterFactor must be within [0, 1]".to_string(),
            ));
        }
        if let Some(rl) = &self.rate_limit {
            if rl.key.is_empty() || rl.max == 0 || rl.window_seconds == 0 {
                return Err(Error::InvalidConfig(
                    "rateLimit requires a key, max >= 1 and windowSeconds >= 1".to_string(),
                ));
            }
        }
        if let Some(idem) = &self.idempotency {
            if idem.key.is_empty() || idem.window == 0 {
                return Err(Error::InvalidConfig(
                    "idempotency requires a key and a window of at least 1 second".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Check a job type name against `^[A-Za-z0-9_-]{1,100}$`.
pub fn validate_job_type(job_type: &str) -> Result<()> {
    let ok = !job_type.is_empty()
        && job_type.len() <= 100
        && job_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidJobType(job_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_retry_script() {
        let cfg = JobConfig::default();
        assert_eq!(cfg.priority(), 5);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.retry.max_delay_ms, 60_000);
        assert!(matches!(cfg.retry.backoff, BackoffKind::Exponential));
        assert!(cfg.retry.enabled);
        assert!((cfg.retry.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut cfg = JobConfig::default();
        cfg.rate_limit = Some(RateLimitConfig {
            key: "encode".to_string(),
            max: 10,
            window_seconds: 60,
            max_concurrent: Some(2),
        });
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["retry"]["maxAttempts"], 3);
        assert_eq!(json["retry"]["baseDelayMs"], 1000);
        assert_eq!(json["rateLimit"]["windowSeconds"], 60);
        assert_eq!(json["rateLimit"]["maxConcurrent"], 2);
        assert_eq!(json["behavior"]["removeOnComplete"], false);
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let cfg: JobConfig = serde_json::from_str(
            r#"{"retry":{"maxAttempts":5,"futureKnob":true},"somethingNew":{}}"#,
        )
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn test_schedule_exclusivity() {
        let mut cfg = JobConfig::default();
        cfg.schedule.delay = Some(1_000);
        assert_eq!(cfg.resolve_scheduled_for(10_000).unwrap(), 11_000);

        cfg.schedule.run_at = Some(99_000);
        let err = cfg.resolve_scheduled_for(10_000).unwrap_err();
        assert_eq!(err.code(), 1002);

        cfg.schedule.delay = None;
        assert_eq!(cfg.resolve_scheduled_for(10_000).unwrap(), 99_000);

        cfg.schedule.run_at = None;
        assert_eq!(cfg.resolve_scheduled_for(10_000).unwrap(), 10_000);
    }

    #[test]
    fn test_priority_range() {
        let mut cfg = JobConfig::default();
        cfg.priority = Some(10);
        assert!(cfg.validate().is_ok());
        cfg.priority = Some(0);
        assert_eq!(cfg.validate().unwrap_err().code(), 1002);
        cfg.priority = Some(11);
        assert_eq!(cfg.validate().unwrap_err().code(), 1002);
    }

    #[test]
    fn test_job_type_pattern() {
        assert!(validate_job_type("send_email-v2").is_ok());
        assert!(validate_job_type("A").is_ok());
        assert!(validate_job_type(&"x".repeat(100)).is_ok());
        assert_eq!(validate_job_type("").unwrap_err().code(), 1003);
        assert_eq!(validate_job_type(&"x".repeat(101)).unwrap_err().code(), 1003);
        assert_eq!(validate_job_type("no spaces").unwrap_err().code(), 1003);
        assert_eq!(validate_job_type("no.dots").unwrap_err().code(), 1003);
    }

    #[test]
    fn test_rate_limit_validation() {
        let mut cfg = JobConfig::default();
        cfg.rate_limit = Some(RateLimitConfig {
            key: String::new(),
            max: 1,
            window_seconds: 1,
            max_concurrent: None,
        });
        assert_eq!(cfg.validate().unwrap_err().code(), 1002);
    }

    #[test]
    fn test_chain_template_round_trip() {
        let template = JobTemplate {
            job_type: "notify".to_string(),
            payload: serde_json::json!({"to": "ops"}),
            config: Box::default(),
        };
        let json = serde_json::to_string(&template).unwrap();
        assert!(json.contains(r#""type":"notify""#));
        let back: JobTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_type, "notify");
    }
}
