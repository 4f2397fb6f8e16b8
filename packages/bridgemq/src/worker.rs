//! Worker loop: claim, execute, finalize.
//!
//! A worker ticks every `tick_interval` and claims while it has spare
//! concurrency; each claimed job runs as its own task. Handlers return an
//! explicit [`HandlerOutcome`]; the loop, not the handler, decides whether
//! that means the complete script or the retry script. Handler bodies are
//! `anyhow::Result` for `?` ergonomics; an `Err` is flattened into an error
//! record at this boundary and treated as a retryable failure.
//!
//! ```text
//! Worker tick
//!     │
//!     ├─► claim_job (script: routing + rate limit + queue pop)
//!     │       │
//!     │       ▼
//!     │   spawn task ──► read job ──► handler.handle()
//!     │                                   │
//!     │                 Success ──► complete_job ──► spawn_chain
//!     │                 Retry   ──► retry_job (backoff or DLQ)
//!     │                 Fail    ──► record_error + complete_job(failed)
//!     │
//!     └─► lock renewal every stallTimeout/3 while a handler runs
//! ```
//!
//! # Shutdown
//!
//! Cancelling the worker stops claiming, marks the server `draining`, and
//! waits up to `shutdown_timeout` for in-flight handlers. Whatever is still
//! running after the deadline is abandoned to the stall detector, which is
//! the crash-recovery path doing its normal job.
//!
//! # Panics
//!
//! A panicking handler kills only its own task; the concurrency slot is
//! released by a drop guard and the job is recovered by stall detection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::job::{Job, JobStatus};
use crate::registry::{Registry, ServerInfo, ServerStatus};
use crate::repository::Repository;
use crate::retry::{is_retry_eligible, JobErrorRecord};
use crate::routing::WorkerProfile;

/// In-process lifecycle notifications, for metrics and tests.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { server_id: String },
    JobStart { job_id: String },
    JobProgress { job_id: String, progress: f64 },
    JobComplete { job_id: String, processing_time: i64 },
    JobFail { job_id: String, error: String },
    Stopped { server_id: String },
}

/// What a handler decided about its job.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Job done; the value becomes the stored result.
    Success(serde_json::Value),
    /// Transient failure; route through the retry policy.
    Retry(JobErrorRecord),
    /// Permanent failure; finalize as failed without retrying.
    Fail(JobErrorRecord),
}

/// Per-invocation context handed to handlers.
#[derive(Clone)]
pub struct JobContext {
    repo: Repository,
    events: broadcast::Sender<WorkerEvent>,
    pub job_id: String,
    /// Attempt counter at execution time (0 for the first run).
    pub attempt: u32,
}

impl JobContext {
    /// Report progress (0–100); persisted and mirrored as an in-process
    /// event. Errors are swallowed; progress is advisory.
    pub async fn progress(&self, progress: f64) {
        if let Err(e) = self.repo.set_progress(&self.job_id, progress).await {
            warn!(job_id = %self.job_id, error = %e, "progress write failed");
        }
        let _ = self.events.send(WorkerEvent::JobProgress {
            job_id: self.job_id.clone(),
            progress,
        });
    }

    /// Millisecond clock shared with the rest of the worker.
    pub fn now_ms(&self) -> i64 {
        self.repo.clock().now_ms()
    }
}

/// Handler for one job type.
///
/// Returning `Err` is equivalent to `Ok(HandlerOutcome::Retry(..))` with the
/// error chain captured; return `Fail` explicitly for permanent failures.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<HandlerOutcome>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_id: String,
    pub mesh_id: String,
    pub stack: String,
    pub region: String,
    pub capabilities: Vec<String>,
    /// Maximum concurrently-executing handlers (>= 1).
    pub concurrency: usize,
    /// Claim-loop tick.
    pub tick_interval: Duration,
    /// Candidate budget per claim script invocation.
    pub claim_scan_limit: u32,
    /// Stall timeout the maintenance loops run with; lock renewal fires at a
    /// third of this.
    pub stall_timeout: Duration,
    /// Grace period for in-flight handlers on shutdown.
    pub shutdown_timeout: Duration,
    /// Server registration heartbeat period.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: format!("worker-{}", Uuid::new_v4()),
            mesh_id: "default".to_string(),
            stack: String::new(),
            region: String::new(),
            capabilities: Vec::new(),
            concurrency: 4,
            tick_interval: Duration::from_millis(100),
            claim_scan_limit: 100,
            stall_timeout: Duration::from_millis(300_000),
            shutdown_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn new(server_id: impl Into<String>, mesh_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            mesh_id: mesh_id.into(),
            ..Default::default()
        }
    }

    pub fn profile(&self) -> WorkerProfile {
        WorkerProfile {
            server_id: self.server_id.clone(),
            stack: self.stack.clone(),
            region: self.region.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Releases one concurrency slot on drop, panic included.
struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A claim/execute/complete worker bound to one mesh.
pub struct Worker {
    config: WorkerConfig,
    repo: Repository,
    registry: Registry,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    inflight: Arc<AtomicUsize>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(repo: Repository, registry: Registry, config: WorkerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            repo,
            registry,
            handlers: DashMap::new(),
            inflight: Arc::new(AtomicUsize::new(0)),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the handler for a job type. Last registration wins.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Subscribe to in-process lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Token that stops the claim loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Run until shutdown: register, heartbeat, claim, drain.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut info = ServerInfo::new(&self.config.server_id, &self.config.mesh_id);
        info.stack = self.config.stack.clone();
        info.region = self.config.region.clone();
        info.capabilities = self.config.capabilities.clone();
        self.registry
            .register_server(&info, self.repo.clock().as_ref())
            .await?;

        let heartbeat = self.clone().spawn_heartbeat();
        let _ = self.events.send(WorkerEvent::Started {
            server_id: self.config.server_id.clone(),
        });
        info!(
            server_id = %self.config.server_id,
            mesh_id = %self.config.mesh_id,
            concurrency = self.config.concurrency,
            "worker started"
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.claim_until_full().await;
                }
            }
        }

        // Drain: stop claiming, let in-flight handlers finish.
        if let Err(e) = self
            .registry
            .set_status(&self.config.server_id, ServerStatus::Draining)
            .await
        {
            warn!(error = %e, "could not mark server draining");
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.inflight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.inflight();
        if leftover > 0 {
            // The stall detector will recover anything still running.
            warn!(leftover, "shutdown timeout reached with jobs in flight");
        }

        heartbeat.abort();
        if let Err(e) = self
            .registry
            .deregister_server(&self.config.server_id, &[self.config.mesh_id.clone()])
            .await
        {
            warn!(error = %e, "server deregistration failed");
        }
        let _ = self.events.send(WorkerEvent::Stopped {
            server_id: self.config.server_id.clone(),
        });
        info!(server_id = %self.config.server_id, "worker stopped");
        Ok(())
    }

    /// Claim jobs until the concurrency bound or an empty queue.
    async fn claim_until_full(self: &Arc<Self>) {
        let profile = self.config.profile();
        while self.inflight() < self.config.concurrency {
            let claimed = match self
                .repo
                .claim_job(&self.config.mesh_id, &profile, self.config.claim_scan_limit)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "claim failed");
                    break;
                }
            };
            let Some(job_id) = claimed else { break };
            self.inflight.fetch_add(1, Ordering::SeqCst);
            let worker = self.clone();
            tokio::spawn(async move {
                let _slot = InflightGuard(worker.inflight.clone());
                worker.process_job(job_id).await;
            });
        }
    }

    fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let load = self.inflight() as u32;
                        if let Err(e) = self
                            .registry
                            .heartbeat(&self.config.server_id, load, self.repo.clock().as_ref())
                            .await
                        {
                            warn!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn process_job(self: &Arc<Self>, job_id: String) {
        let job = match self.repo.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "claimed job vanished before execution");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "claimed job unreadable; leaving to stall recovery");
                return;
            }
        };

        let handler = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.value().clone(),
            None => {
                // Routing should have kept this job away; treat as a worker
                // configuration defect, not a transient failure.
                let record = JobErrorRecord::new(
                    3001,
                    format!("no handler registered for job type {:?}", job.job_type),
                    self.repo.clock().now_ms(),
                )
                .non_retryable();
                self.finalize_failed(&job, record).await;
                return;
            }
        };

        let _ = self.events.send(WorkerEvent::JobStart {
            job_id: job_id.clone(),
        });
        debug!(job_id, job_type = %job.job_type, attempt = job.attempt, "job start");

        // Renew the claim while the handler runs so a slow handler is not
        // mistaken for a stall.
        let renewal_cancel = CancellationToken::new();
        let renewal = {
            let repo = self.repo.clone();
            let server_id = self.config.server_id.clone();
            let job_id = job_id.clone();
            let period = self.config.stall_timeout / 3;
            let cancel = renewal_cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = repo.touch_active(&server_id, &job_id).await {
                                warn!(job_id = %job_id, error = %e, "lock renewal failed");
                            }
                        }
                    }
                }
            })
        };

        let ctx = JobContext {
            repo: self.repo.clone(),
            events: self.events.clone(),
            job_id: job_id.clone(),
            attempt: job.attempt,
        };
        let retry_enabled = job.config.retry.enabled;
        let outcome = match handler.handle(job.clone(), ctx).await {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::Retry(JobErrorRecord::from_anyhow(
                &e,
                self.repo.clock().now_ms(),
            )),
        };

        renewal_cancel.cancel();
        let _ = renewal.await;

        match outcome {
            HandlerOutcome::Success(result) => {
                match self
                    .repo
                    .complete_job(
                        &job_id,
                        &self.config.server_id,
                        JobStatus::Completed,
                        Some(&result),
                    )
                    .await
                {
                    Ok(outcome) if outcome.success => {
                        let _ = self.registry.record_outcome(&self.config.server_id, false).await;
                        self.drain_chain(&job).await;
                        let _ = self.events.send(WorkerEvent::JobComplete {
                            job_id: job_id.clone(),
                            processing_time: outcome.processing_time,
                        });
                        debug!(job_id, processing_time = outcome.processing_time, "job complete");
                    }
                    Ok(outcome) => {
                        warn!(job_id, error = ?outcome.error, "completion refused");
                    }
                    Err(e) => error!(job_id, error = %e, "complete script failed"),
                }
            }
            HandlerOutcome::Retry(record) if retry_enabled && is_retry_eligible(&record) => {
                match self
                    .repo
                    .retry_job(&job_id, &self.config.server_id, &record)
                    .await
                {
                    Ok(outcome) if outcome.moved_to_dlq => {
                        let _ = self.registry.record_outcome(&self.config.server_id, true).await;
                        let _ = self.events.send(WorkerEvent::JobFail {
                            job_id: job_id.clone(),
                            error: record.message.clone(),
                        });
                        warn!(job_id, attempt = outcome.attempt, "retries exhausted, job dead-lettered");
                    }
                    Ok(outcome) => {
                        let _ = self.events.send(WorkerEvent::JobFail {
                            job_id: job_id.clone(),
                            error: record.message.clone(),
                        });
                        debug!(
                            job_id,
                            attempt = outcome.attempt,
                            next_run_at = outcome.next_run_at,
                            "job rescheduled"
                        );
                    }
                    Err(e) => error!(job_id, error = %e, "retry script failed"),
                }
            }
            HandlerOutcome::Retry(record) | HandlerOutcome::Fail(record) => {
                self.finalize_failed(&job, record).await;
            }
        }
    }

    /// Terminal failure without the retry path: record the error, finalize,
    /// and fire any failure chain.
    async fn finalize_failed(self: &Arc<Self>, job: &Job, record: JobErrorRecord) {
        if let Err(e) = self.repo.record_error(&job.id, &record).await {
            warn!(job_id = %job.id, error = %e, "error record write failed");
        }
        match self
            .repo
            .complete_job(&job.id, &self.config.server_id, JobStatus::Failed, None)
            .await
        {
            Ok(outcome) if outcome.success => {
                let _ = self.registry.record_outcome(&self.config.server_id, true).await;
                self.drain_chain(job).await;
            }
            Ok(outcome) => warn!(job_id = %job.id, error = ?outcome.error, "failure finalize refused"),
            Err(e) => error!(job_id = %job.id, error = %e, "failure finalize script failed"),
        }
        let _ = self.events.send(WorkerEvent::JobFail {
            job_id: job.id.clone(),
            error: record.message,
        });
    }

    /// Create any successors the complete script staged.
    async fn drain_chain(&self, job: &Job) {
        if job.config.chain.is_empty() {
            return;
        }
        match self.repo.spawn_chain(&job.id, &job.mesh_id).await {
            Ok(created) if !created.is_empty() => {
                debug!(job_id = %job.id, count = created.len(), "chain jobs created");
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "chain spawn failed"),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("server_id", &self.config.server_id)
            .field("mesh_id", &self.config.mesh_id)
            .field("concurrency", &self.config.concurrency)
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.server_id.starts_with("worker-"));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.stall_timeout, Duration::from_millis(300_000));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_profile_mirrors_config() {
        let mut config = WorkerConfig::new("w-1", "media");
        config.stack = "rust".to_string();
        config.region = "eu".to_string();
        config.capabilities = vec!["gpu:cuda".to_string()];
        let profile = config.profile();
        assert_eq!(profile.server_id, "w-1");
        assert_eq!(profile.stack, "rust");
        assert_eq!(profile.capabilities, vec!["gpu:cuda"]);
    }

    #[test]
    fn test_inflight_guard_releases_slot() {
        let counter = Arc::new(AtomicUsize::new(1));
        {
            let _guard = InflightGuard(counter.clone());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_renewal_period_is_a_third_of_stall_timeout() {
        let config = WorkerConfig::default();
        assert_eq!(config.stall_timeout / 3, Duration::from_secs(100));
    }
}
