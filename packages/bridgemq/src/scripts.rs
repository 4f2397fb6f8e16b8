//! The atomic script set and its typed outcomes.
//!
//! Every multi-key mutation in the broker is one of these scripts. A script
//! executes with whole-script atomicity (no other command from any client
//! interleaves), which is the only synchronization primitive the broker
//! relies on. Scripts are uploaded once and addressed by digest afterwards;
//! `redis::Script` re-uploads transparently on NOSCRIPT.
//!
//! Scripts never raise. Each returns a JSON document decoded here into a
//! typed outcome; `claim_job` returns the bare job id or nil.

use redis::Script;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Error, Result};

/// All server-side scripts, compiled once per process.
pub struct ScriptSet {
    create_job: Script,
    claim_job: Script,
    complete_job: Script,
    retry_job: Script,
    process_delayed: Script,
    detect_stalled: Script,
    rate_limit: Script,
    finalize_batch: Script,
    cancel_job: Script,
    cleanup: Script,
}

impl Default for ScriptSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptSet {
    pub fn new() -> Self {
        Self {
            create_job: Script::new(include_str!("../lua/create_job.lua")),
            claim_job: Script::new(include_str!("../lua/claim_job.lua")),
            complete_job: Script::new(include_str!("../lua/complete_job.lua")),
            retry_job: Script::new(include_str!("../lua/retry_job.lua")),
            process_delayed: Script::new(include_str!("../lua/process_delayed.lua")),
            detect_stalled: Script::new(include_str!("../lua/detect_stalled.lua")),
            rate_limit: Script::new(include_str!("../lua/rate_limit.lua")),
            finalize_batch: Script::new(include_str!("../lua/finalize_batch.lua")),
            cancel_job: Script::new(include_str!("../lua/cancel_job.lua")),
            cleanup: Script::new(include_str!("../lua/cleanup.lua")),
        }
    }
}

/// Arguments for `create_job.lua`, in argument order.
#[derive(Debug, Clone)]
pub struct CreateJobArgs {
    pub job_id: String,
    pub job_type: String,
    pub version: String,
    pub mesh_id: String,
    pub priority: u8,
    pub now: i64,
    pub scheduled_for: i64,
    pub config_json: String,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
    pub idempotency_ttl: u64,
    pub fingerprint: String,
    pub fingerprint_ttl: u64,
    pub lifecycle_ttl: u64,
    pub depends_json: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub job_id: String,
    pub existing: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Waiters released into the pending queue by this completion.
    #[serde(default)]
    pub triggered: Vec<String>,
    #[serde(default)]
    pub processing_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub will_retry: bool,
    #[serde(default)]
    pub moved_to_dlq: bool,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub next_run_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteOutcome {
    pub processed: u64,
    #[serde(default)]
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StallOutcome {
    pub detected: u64,
    pub recovered: u64,
    pub moved_to_dlq: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    #[serde(default)]
    pub remaining: i64,
    /// Millisecond timestamp when the window resets.
    pub reset: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFinalizeOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// The blocking status when cancellation was refused.
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

fn decode<T: DeserializeOwned>(raw: String) -> Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| Error::StorageRead(format!("undecodable script outcome: {e}: {raw}")))
}

impl ScriptSet {
    pub async fn create_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        args: &CreateJobArgs,
    ) -> Result<CreateOutcome> {
        let raw: String = self
            .create_job
            .arg(ns)
            .arg(&args.job_id)
            .arg(&args.job_type)
            .arg(&args.version)
            .arg(&args.mesh_id)
            .arg(args.priority)
            .arg(args.now)
            .arg(args.scheduled_for)
            .arg(&args.config_json)
            .arg(args.payload.as_slice())
            .arg(&args.idempotency_key)
            .arg(args.idempotency_ttl)
            .arg(&args.fingerprint)
            .arg(args.fingerprint_ttl)
            .arg(args.lifecycle_ttl)
            .arg(&args.depends_json)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn claim_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        mesh_id: &str,
        server_id: &str,
        stack: &str,
        region: &str,
        capabilities_json: &str,
        now: i64,
        scan_limit: u32,
    ) -> Result<Option<String>> {
        let claimed: Option<String> = self
            .claim_job
            .arg(ns)
            .arg(mesh_id)
            .arg(server_id)
            .arg(stack)
            .arg(region)
            .arg(capabilities_json)
            .arg(now)
            .arg(scan_limit)
            .invoke_async(conn)
            .await?;
        Ok(claimed)
    }

    pub async fn complete_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        job_id: &str,
        server_id: &str,
        final_status: &str,
        result_json: &str,
        now: i64,
    ) -> Result<CompleteOutcome> {
        let raw: String = self
            .complete_job
            .arg(ns)
            .arg(job_id)
            .arg(server_id)
            .arg(final_status)
            .arg(result_json)
            .arg(now)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn retry_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        job_id: &str,
        server_id: &str,
        error_json: &str,
        now: i64,
        jitter_unit: f64,
    ) -> Result<RetryOutcome> {
        let raw: String = self
            .retry_job
            .arg(ns)
            .arg(job_id)
            .arg(server_id)
            .arg(error_json)
            .arg(now)
            .arg(jitter_unit)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    pub async fn process_delayed(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        now: i64,
        batch: u32,
    ) -> Result<PromoteOutcome> {
        let raw: String = self
            .process_delayed
            .arg(ns)
            .arg(now)
            .arg(batch)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    pub async fn detect_stalled(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        now: i64,
        stall_timeout_ms: i64,
        max_stall_count: u32,
    ) -> Result<StallOutcome> {
        let raw: String = self
            .detect_stalled
            .arg(ns)
            .arg(now)
            .arg(stall_timeout_ms)
            .arg(max_stall_count)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn rate_limit(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        enqueue_job_id: &str,
        now: i64,
    ) -> Result<RateLimitDecision> {
        let raw: String = self
            .rate_limit
            .arg(ns)
            .arg(bucket)
            .arg(max)
            .arg(window_seconds)
            .arg(enqueue_job_id)
            .arg(now)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_batch(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        mesh_id: &str,
        job_type: &str,
        priority: u8,
        batch_id: &str,
        now: i64,
    ) -> Result<BatchFinalizeOutcome> {
        let raw: String = self
            .finalize_batch
            .arg(ns)
            .arg(mesh_id)
            .arg(job_type)
            .arg(priority)
            .arg(batch_id)
            .arg(now)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    pub async fn cancel_job(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        job_id: &str,
        now: i64,
    ) -> Result<CancelOutcome> {
        let raw: String = self
            .cancel_job
            .arg(ns)
            .arg(job_id)
            .arg(now)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn cleanup(
        &self,
        conn: &mut deadpool_redis::Connection,
        ns: &str,
        now: i64,
        completed_ttl_ms: i64,
        cancelled_ttl_ms: i64,
        failed_ttl_ms: i64,
        batch: u32,
    ) -> Result<CleanupOutcome> {
        let raw: String = self
            .cleanup
            .arg(ns)
            .arg(now)
            .arg(completed_ttl_ms)
            .arg(cancelled_ttl_ms)
            .arg(failed_ttl_ms)
            .arg(batch)
            .invoke_async(conn)
            .await?;
        decode(raw)
    }
}

impl std::fmt::Debug for ScriptSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_compile_to_distinct_digests() {
        let scripts = ScriptSet::new();
        let hashes = [
            scripts.create_job.get_hash().to_string(),
            scripts.claim_job.get_hash().to_string(),
            scripts.complete_job.get_hash().to_string(),
            scripts.retry_job.get_hash().to_string(),
            scripts.process_delayed.get_hash().to_string(),
            scripts.detect_stalled.get_hash().to_string(),
            scripts.rate_limit.get_hash().to_string(),
            scripts.finalize_batch.get_hash().to_string(),
            scripts.cancel_job.get_hash().to_string(),
            scripts.cleanup.get_hash().to_string(),
        ];
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), hashes.len());
        for hash in &hashes {
            assert_eq!(hash.len(), 40);
        }
    }

    #[test]
    fn test_outcome_decoding() {
        let outcome: CreateOutcome =
            decode(r#"{"jobId":"j1","existing":true,"reason":"idempotency"}"#.to_string()).unwrap();
        assert!(outcome.existing);
        assert_eq!(outcome.reason.as_deref(), Some("idempotency"));

        // Lua omits `triggered` when empty.
        let outcome: CompleteOutcome =
            decode(r#"{"success":true,"processingTime":125}"#.to_string()).unwrap();
        assert!(outcome.success);
        assert!(outcome.triggered.is_empty());
        assert_eq!(outcome.processing_time, 125);

        let outcome: RetryOutcome = decode(
            r#"{"success":true,"willRetry":true,"movedToDlq":false,"attempt":2,"delayMs":2000,"nextRunAt":99}"#
                .to_string(),
        )
        .unwrap();
        assert!(outcome.will_retry);
        assert_eq!(outcome.attempt, 2);
        assert_eq!(outcome.delay_ms, Some(2000));

        let outcome: StallOutcome =
            decode(r#"{"detected":3,"recovered":2,"movedToDlq":1}"#.to_string()).unwrap();
        assert_eq!(outcome.detected, 3);
        assert_eq!(outcome.moved_to_dlq, 1);
    }

    #[test]
    fn test_undecodable_outcome_is_read_error() {
        let err = decode::<CreateOutcome>("not json".to_string()).unwrap_err();
        assert_eq!(err.code(), 9005);
    }
}
