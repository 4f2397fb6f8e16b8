//! Background maintenance: delayed promotion, stall detection, cleanup.
//!
//! Three independent periodic tasks, each a single-shot script invocation.
//! They are idempotent and safe to run in any process and in parallel, since
//! the scripts serialize on the store. Every loop logs and continues on error;
//! maintenance never gives up.
//!
//! Periods run through a [`Scheduler`] so tests can drive virtual time
//! instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::repository::Repository;

/// Waits out one period between loop iterations.
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    async fn wait(&self, period: Duration);
}

/// Real-time scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalScheduler;

#[async_trait::async_trait]
impl Scheduler for IntervalScheduler {
    async fn wait(&self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

/// Maintenance cadence and limits.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub promote_interval: Duration,
    pub promote_batch: u32,
    pub stall_interval: Duration,
    pub stall_timeout: Duration,
    pub max_stall_count: u32,
    pub clean_interval: Duration,
    pub clean_batch: u32,
    /// Retention for completed jobs.
    pub completed_retention: Duration,
    /// Retention for cancelled jobs.
    pub cancelled_retention: Duration,
    /// Retention for failed jobs (DLQ entries included).
    pub failed_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            promote_interval: Duration::from_secs(1),
            promote_batch: 100,
            stall_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_millis(300_000),
            max_stall_count: 3,
            clean_interval: Duration::from_secs(300),
            clean_batch: 200,
            completed_retention: Duration::from_secs(24 * 3600),
            cancelled_retention: Duration::from_secs(24 * 3600),
            failed_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Owns the three maintenance loops.
pub struct Maintenance {
    repo: Repository,
    config: MaintenanceConfig,
    scheduler: Arc<dyn Scheduler>,
}

impl Maintenance {
    pub fn new(repo: Repository, config: MaintenanceConfig) -> Self {
        Self {
            repo,
            config,
            scheduler: Arc::new(IntervalScheduler),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// One promote pass.
    pub async fn promote_once(&self) -> Result<u64> {
        let outcome = self.repo.process_delayed(self.config.promote_batch).await?;
        if outcome.processed > 0 {
            debug!(promoted = outcome.processed, "delayed jobs promoted");
        }
        Ok(outcome.processed)
    }

    /// One stall-detection pass.
    pub async fn detect_stalled_once(&self) -> Result<(u64, u64, u64)> {
        let outcome = self
            .repo
            .detect_stalled(
                self.config.stall_timeout.as_millis() as i64,
                self.config.max_stall_count,
            )
            .await?;
        if outcome.detected > 0 {
            info!(
                detected = outcome.detected,
                recovered = outcome.recovered,
                dead_lettered = outcome.moved_to_dlq,
                "stalled jobs handled"
            );
        }
        Ok((outcome.detected, outcome.recovered, outcome.moved_to_dlq))
    }

    /// One cleanup pass.
    pub async fn clean_once(&self) -> Result<u64> {
        let outcome = self
            .repo
            .cleanup(
                self.config.completed_retention.as_millis() as i64,
                self.config.cancelled_retention.as_millis() as i64,
                self.config.failed_retention.as_millis() as i64,
                self.config.clean_batch,
            )
            .await?;
        let reaped = outcome.completed + outcome.cancelled + outcome.failed;
        if reaped > 0 {
            debug!(
                completed = outcome.completed,
                cancelled = outcome.cancelled,
                failed = outcome.failed,
                "terminal jobs reaped"
            );
        }
        Ok(reaped)
    }

    /// Spawn all three loops; they stop when `shutdown` fires.
    pub fn spawn_all(self: Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.clone().spawn_loop(
                "promote-delayed",
                self.config.promote_interval,
                shutdown.clone(),
                |m| Box::pin(async move { m.promote_once().await.map(|_| ()) }),
            ),
            self.clone().spawn_loop(
                "detect-stalled",
                self.config.stall_interval,
                shutdown.clone(),
                |m| Box::pin(async move { m.detect_stalled_once().await.map(|_| ()) }),
            ),
            self.clone().spawn_loop(
                "clean",
                self.config.clean_interval,
                shutdown,
                |m| Box::pin(async move { m.clean_once().await.map(|_| ()) }),
            ),
        ]
    }

    fn spawn_loop(
        self: Arc<Self>,
        name: &'static str,
        period: Duration,
        shutdown: CancellationToken,
        run: fn(Arc<Self>) -> futures::future::BoxFuture<'static, Result<()>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(loop_name = name, period_ms = period.as_millis() as u64, "maintenance loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.scheduler.wait(period) => {
                        if let Err(e) = run(self.clone()).await {
                            warn!(loop_name = name, error = %e, "maintenance pass failed; continuing");
                        }
                    }
                }
            }
            info!(loop_name = name, "maintenance loop stopped");
        })
    }
}

impl std::fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
