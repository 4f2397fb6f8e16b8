//! Typed read/write surface over the key schema and the atomic scripts.
//!
//! The mutation discipline: anything that crosses a key boundary is a script
//! invocation; direct commands are reserved for single-key updates (status,
//! progress, lock renewal) and read-only aggregation. That split is what
//! keeps the queue invariants intact under concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::codec;
use crate::config::{JobConfig, JobTemplate, DEFAULT_DEDUP_WINDOW_SECS};
use crate::error::{Error, Result};
use crate::job::{Job, JobMeta, JobStatus, NewJob};
use crate::keys::{fingerprint_hash, Keys};
use crate::retry::{draw_jitter_unit, JobErrorRecord};
use crate::scripts::{
    BatchFinalizeOutcome, CancelOutcome, CleanupOutcome, CompleteOutcome, CreateJobArgs,
    CreateOutcome, PromoteOutcome, RateLimitDecision, RetryOutcome, ScriptSet, StallOutcome,
};
use crate::store::Store;

/// Receipt from a create call.
#[derive(Debug, Clone)]
pub struct CreateReceipt {
    pub job_id: String,
    /// True when an idempotency key or fingerprint matched an existing job.
    pub existing: bool,
    /// `"idempotency"` or `"fingerprint"` when `existing`.
    pub reason: Option<String>,
}

/// The broker's state repository.
///
/// Cheap to clone; clones share the store pool, the compiled script set and
/// the clock.
#[derive(Clone)]
pub struct Repository {
    store: Store,
    keys: Keys,
    scripts: Arc<ScriptSet>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    pub fn new(store: Store, keys: Keys, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            keys,
            scripts: Arc::new(ScriptSet::new()),
            clock,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Validate and atomically materialize a job.
    ///
    /// Dedup short-circuits: when the idempotency key or fingerprint already
    /// maps to a job, that job's id comes back and nothing is written.
    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type, mesh_id = %new_job.mesh_id))]
    pub async fn create_job(&self, new_job: NewJob) -> Result<CreateReceipt> {
        crate::config::validate_job_type(&new_job.job_type)?;
        new_job.config.validate()?;

        let now = self.now();
        let scheduled_for = new_job.config.resolve_scheduled_for(now)?;
        let job_id = new_job
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let config_json = serde_json::to_string(&new_job.config)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let depends_json = serde_json::to_string(&new_job.config.dependencies.wait_for)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let (idempotency_key, idempotency_ttl) = match &new_job.config.idempotency {
            Some(idem) => (idem.key.clone(), idem.window),
            None => (String::new(), DEFAULT_DEDUP_WINDOW_SECS),
        };
        let fingerprint = if new_job.config.behavior.deduplication {
            fingerprint_hash(&new_job.job_type, &new_job.payload)
        } else {
            String::new()
        };
        let lifecycle_ttl = new_job.config.lifecycle.map(|l| l.ttl).unwrap_or(0);

        let args = CreateJobArgs {
            job_id,
            job_type: new_job.job_type,
            version: new_job.version,
            mesh_id: new_job.mesh_id,
            priority: new_job.config.priority(),
            now,
            scheduled_for,
            config_json,
            payload: new_job.payload,
            idempotency_key,
            idempotency_ttl,
            fingerprint,
            fingerprint_ttl: DEFAULT_DEDUP_WINDOW_SECS,
            lifecycle_ttl,
            depends_json,
        };

        let mut conn = self.store.conn().await?;
        let outcome: CreateOutcome = self
            .scripts
            .create_job(&mut conn, self.keys.namespace(), &args)
            .await?;
        debug!(job_id = %outcome.job_id, existing = outcome.existing, "job create");
        Ok(CreateReceipt {
            job_id: outcome.job_id,
            existing: outcome.existing,
            reason: outcome.reason,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Header only.
    pub async fn get_meta(&self, job_id: &str) -> Result<Option<JobMeta>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job_meta(job_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::meta_from_map(&map).map(Some)
    }

    /// Header plus config and payload.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job_meta(job_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        let meta = Job::meta_from_map(&map)?;
        let config_json: Option<String> = redis::cmd("GET")
            .arg(self.keys.job_config(job_id))
            .query_async(&mut conn)
            .await?;
        let config: JobConfig = match config_json {
            Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                .map_err(|e| Error::StorageRead(format!("job {job_id} config: {e}")))?,
            _ => JobConfig::default(),
        };
        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.keys.job_payload(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(Some(meta.into_job(config, payload.unwrap_or_default())))
    }

    /// Handler return value, decoded from the result blob.
    pub async fn get_result(&self, job_id: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.store.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.job_result(job_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StorageRead(format!("job {job_id} result: {e}"))),
        }
    }

    /// Error history, newest first, capped at 10 entries by the store.
    pub async fn get_errors(&self, job_id: &str) -> Result<Vec<JobErrorRecord>> {
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.job_errors(job_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(crate::job::parse_error_history(&raw))
    }

    // =========================================================================
    // Single-key mutations (permitted outside scripts)
    // =========================================================================

    /// Progress write; clamped to 0–100.
    pub async fn set_progress(&self, job_id: &str, progress: f64) -> Result<()> {
        let progress = progress.clamp(0.0, 100.0);
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(self.keys.job_meta(job_id))
            .arg("progress")
            .arg(progress)
            .arg("updatedAt")
            .arg(self.now())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Lock renewal: refresh the active-map entry so the stall detector
    /// keeps its hands off a long-running handler. Ownership is implicit in
    /// map membership plus `processedBy`.
    pub async fn touch_active(&self, server_id: &str, job_id: &str) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(self.keys.active(server_id))
            .arg(job_id)
            .arg(self.now())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Record a handler error without going through the retry path.
    pub async fn record_error(&self, job_id: &str, error: &JobErrorRecord) -> Result<()> {
        let payload =
            serde_json::to_string(error).map_err(|e| Error::StorageWrite(e.to_string()))?;
        let mut conn = self.store.conn().await?;
        let errors_key = self.keys.job_errors(job_id);
        let _: i64 = redis::cmd("LPUSH")
            .arg(&errors_key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("LTRIM")
            .arg(&errors_key)
            .arg(0)
            .arg(9)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Script-backed transitions
    // =========================================================================

    /// Claim the best eligible job for a worker, or `None`.
    #[instrument(skip(self, profile), fields(server_id = %profile.server_id))]
    pub async fn claim_job(
        &self,
        mesh_id: &str,
        profile: &crate::routing::WorkerProfile,
        scan_limit: u32,
    ) -> Result<Option<String>> {
        let capabilities_json = serde_json::to_string(&profile.capabilities)
            .map_err(|e| Error::StorageWrite(e.to_string()))?;
        let mut conn = self.store.conn().await?;
        self.scripts
            .claim_job(
                &mut conn,
                self.keys.namespace(),
                mesh_id,
                &profile.server_id,
                &profile.stack,
                &profile.region,
                &capabilities_json,
                self.now(),
                scan_limit,
            )
            .await
    }

    /// Finalize a job the caller owns.
    #[instrument(skip(self, result))]
    pub async fn complete_job(
        &self,
        job_id: &str,
        server_id: &str,
        final_status: JobStatus,
        result: Option<&serde_json::Value>,
    ) -> Result<CompleteOutcome> {
        if !final_status.is_terminal() {
            return Err(Error::InvalidState {
                expected: "completed, failed or cancelled",
                actual: final_status.to_string(),
            });
        }
        let result_json = match result {
            Some(value) => {
                serde_json::to_string(value).map_err(|e| Error::StorageWrite(e.to_string()))?
            }
            None => String::new(),
        };
        let mut conn = self.store.conn().await?;
        let outcome = self
            .scripts
            .complete_job(
                &mut conn,
                self.keys.namespace(),
                job_id,
                server_id,
                final_status.as_str(),
                &result_json,
                self.now(),
            )
            .await?;
        if !outcome.success {
            warn!(job_id, error = ?outcome.error, "complete refused by store");
        }
        Ok(outcome)
    }

    /// Route a handler failure through backoff or the DLQ.
    #[instrument(skip(self, error))]
    pub async fn retry_job(
        &self,
        job_id: &str,
        server_id: &str,
        error: &JobErrorRecord,
    ) -> Result<RetryOutcome> {
        let error_json =
            serde_json::to_string(error).map_err(|e| Error::StorageWrite(e.to_string()))?;
        let mut conn = self.store.conn().await?;
        self.scripts
            .retry_job(
                &mut conn,
                self.keys.namespace(),
                job_id,
                server_id,
                &error_json,
                self.now(),
                draw_jitter_unit(),
            )
            .await
    }

    /// Promote ready delayed entries; bounded by `batch`.
    pub async fn process_delayed(&self, batch: u32) -> Result<PromoteOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .process_delayed(&mut conn, self.keys.namespace(), self.now(), batch.min(100))
            .await
    }

    /// Recover or dead-letter jobs whose claims went stale.
    pub async fn detect_stalled(
        &self,
        stall_timeout_ms: i64,
        max_stall_count: u32,
    ) -> Result<StallOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .detect_stalled(
                &mut conn,
                self.keys.namespace(),
                self.now(),
                stall_timeout_ms,
                max_stall_count,
            )
            .await
    }

    /// Fixed-window check; pass `enqueue_job_id` to park the job on the
    /// overflow list when saturated.
    pub async fn rate_limit_check(
        &self,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        enqueue_job_id: Option<&str>,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .rate_limit(
                &mut conn,
                self.keys.namespace(),
                bucket,
                max,
                window_seconds,
                enqueue_job_id.unwrap_or(""),
                self.now(),
            )
            .await
    }

    /// Fold the accumulation list for `(mesh, type)` into one batch job.
    pub async fn finalize_batch(
        &self,
        mesh_id: &str,
        job_type: &str,
        priority: u8,
        batch_id: &str,
    ) -> Result<BatchFinalizeOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .finalize_batch(
                &mut conn,
                self.keys.namespace(),
                mesh_id,
                job_type,
                priority,
                batch_id,
                self.now(),
            )
            .await
    }

    /// Append a job to the batch accumulation list.
    pub async fn accumulate_batch(&self, mesh_id: &str, job_type: &str, job_id: &str) -> Result<i64> {
        let mut conn = self.store.conn().await?;
        let len: i64 = redis::cmd("RPUSH")
            .arg(self.keys.batch_acc(mesh_id, job_type))
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Cancel a pending or scheduled job.
    ///
    /// The queue entry stays where it is; claim skips it by status and the
    /// cleaner reaps it.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let outcome: CancelOutcome = self
            .scripts
            .cancel_job(&mut conn, self.keys.namespace(), job_id, self.now())
            .await?;
        if outcome.success {
            return Ok(());
        }
        match outcome.error.as_deref() {
            Some("not_found") => Err(Error::JobNotFound(job_id.to_string())),
            _ => Err(Error::InvalidState {
                expected: "pending or scheduled",
                actual: outcome.status.unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }

    /// Age-based reap of terminal jobs.
    pub async fn cleanup(
        &self,
        completed_ttl_ms: i64,
        cancelled_ttl_ms: i64,
        failed_ttl_ms: i64,
        batch: u32,
    ) -> Result<CleanupOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .cleanup(
                &mut conn,
                self.keys.namespace(),
                self.now(),
                completed_ttl_ms,
                cancelled_ttl_ms,
                failed_ttl_ms,
                batch,
            )
            .await
    }

    // =========================================================================
    // Chains
    // =========================================================================

    /// Drain the successor templates staged by a completion and create them.
    ///
    /// Returns the created job ids. Invalid templates are skipped with a
    /// warning; chain creation must never fail the parent transition.
    pub async fn spawn_chain(&self, parent_job_id: &str, mesh_id: &str) -> Result<Vec<String>> {
        let chain_key = self.keys.job_chain(parent_job_id);
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&chain_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let _: i64 = redis::cmd("DEL").arg(&chain_key).query_async(&mut conn).await?;
        drop(conn);

        let mut created = Vec::new();
        for entry in raw {
            let template: JobTemplate = match serde_json::from_str(&entry) {
                Ok(t) => t,
                Err(e) => {
                    warn!(parent = parent_job_id, error = %e, "skipping malformed chain template");
                    continue;
                }
            };
            let payload = match codec::encode_payload(&template.payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(parent = parent_job_id, error = %e, "skipping unencodable chain payload");
                    continue;
                }
            };
            let new_job = NewJob::new(template.job_type, mesh_id.to_string(), payload)
                .with_config(*template.config);
            match self.create_job(new_job).await {
                Ok(receipt) => created.push(receipt.job_id),
                Err(e) => warn!(parent = parent_job_id, error = %e, "chain job create failed"),
            }
        }
        Ok(created)
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    /// Depth of one priority queue.
    pub async fn queue_depth(&self, mesh_id: &str, job_type: &str, priority: u8) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        let depth: u64 = redis::cmd("ZCARD")
            .arg(self.keys.queue(mesh_id, job_type, priority))
            .query_async(&mut conn)
            .await?;
        Ok(depth)
    }

    /// Size of the aggregated pending index.
    pub async fn pending_count(&self, mesh_id: &str) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.keys.pending(mesh_id))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Pending job ids with their priority scores, highest priority first.
    pub async fn pending_jobs(&self, mesh_id: &str) -> Result<Vec<(String, u8)>> {
        let mut conn = self.store.conn().await?;
        let entries: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(self.keys.pending(mesh_id))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(id, score)| (id, score as u8))
            .collect())
    }

    /// Dead-letter entries, oldest first.
    pub async fn dlq_jobs(&self, mesh_id: &str, limit: isize) -> Result<Vec<String>> {
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.dlq(mesh_id))
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Per-status completion counters for a mesh.
    pub async fn mesh_totals(&self, mesh_id: &str) -> Result<HashMap<String, u64>> {
        let mut conn = self.store.conn().await?;
        let mut totals = HashMap::new();
        for status in ["completed", "failed", "cancelled"] {
            let value: Option<u64> = redis::cmd("GET")
                .arg(self.keys.total(mesh_id, status))
                .query_async(&mut conn)
                .await?;
            totals.insert(status.to_string(), value.unwrap_or(0));
        }
        Ok(totals)
    }

    /// Jobs parked on a rate-limit overflow list.
    pub async fn take_rate_limit_overflow(&self, bucket: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.store.conn().await?;
        let ids: Vec<String> = redis::cmd("LPOP")
            .arg(self.keys.ratelimit_queue(bucket))
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("namespace", &self.keys.namespace())
            .finish_non_exhaustive()
    }
}
