//! Fixed-window rate limiter.
//!
//! One counter per bucket key, armed with the window TTL on its first hit.
//! Claim-path gating lives inside the claim script (a saturated bucket makes
//! the claim skip the job and leave it queued); this client API is for
//! explicit checks and for `check_and_queue`, the only path that populates
//! the overflow list.

use crate::error::Result;
use crate::repository::Repository;
use crate::scripts::RateLimitDecision;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    repo: Repository,
}

impl RateLimiter {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Consume one window slot if available.
    pub async fn check(&self, bucket: &str, max: u32, window_seconds: u32) -> Result<RateLimitDecision> {
        self.repo
            .rate_limit_check(bucket, max, window_seconds, None)
            .await
    }

    /// Like [`check`](Self::check), but a saturated window parks the job id
    /// on the overflow list for later re-submission.
    pub async fn check_and_queue(
        &self,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        job_id: &str,
    ) -> Result<RateLimitDecision> {
        self.repo
            .rate_limit_check(bucket, max, window_seconds, Some(job_id))
            .await
    }

    /// Pop up to `count` parked job ids off the overflow list.
    pub async fn drain_overflow(&self, bucket: &str, count: usize) -> Result<Vec<String>> {
        self.repo.take_rate_limit_overflow(bucket, count).await
    }
}
