//! Batch coordination.
//!
//! Producers accumulate job ids per `(mesh, type)`; finalizing folds the
//! accumulated members under one batch id, parks them as `batched`, and
//! enqueues the batch id itself as a single claimable job of the same type.
//! Batch metadata lives for 24 hours. The batch job carries no payload;
//! handlers read the member list through [`BatchCoordinator::batch_jobs`].

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::scripts::BatchFinalizeOutcome;

/// Batch header as stored under `{ns}:batch:{id}`.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub id: String,
    pub mesh_id: String,
    pub job_type: String,
    pub priority: u8,
    pub size: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    repo: Repository,
}

impl BatchCoordinator {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Stage a job for the next batch of its `(mesh, type)`.
    ///
    /// Returns the accumulation list length after the append, so callers can
    /// finalize on a size threshold.
    pub async fn accumulate(&self, mesh_id: &str, job_type: &str, job_id: &str) -> Result<i64> {
        self.repo.accumulate_batch(mesh_id, job_type, job_id).await
    }

    /// Fold the accumulated members into one queued batch.
    pub async fn finalize(
        &self,
        mesh_id: &str,
        job_type: &str,
        priority: u8,
    ) -> Result<BatchFinalizeOutcome> {
        let batch_id = format!("batch-{}", Uuid::new_v4());
        let outcome = self
            .repo
            .finalize_batch(mesh_id, job_type, priority, &batch_id)
            .await?;
        if !outcome.success {
            return Err(Error::InvalidState {
                expected: "non-empty accumulation list",
                actual: outcome.error.unwrap_or_else(|| "empty_batch".to_string()),
            });
        }
        Ok(outcome)
    }

    pub async fn batch_info(&self, batch_id: &str) -> Result<Option<BatchInfo>> {
        let mut conn = self.repo.store().conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.repo.keys().batch(batch_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| -> Result<String> {
            map.get(name)
                .cloned()
                .ok_or_else(|| Error::StorageRead(format!("batch record missing {name:?}")))
        };
        Ok(Some(BatchInfo {
            id: field("id")?,
            mesh_id: field("meshId")?,
            job_type: field("type")?,
            priority: field("priority")?.parse().unwrap_or(5),
            size: field("size")?.parse().unwrap_or(0),
            created_at: field("createdAt")?.parse().unwrap_or(0),
        }))
    }

    /// Member job ids of a batch, in accumulation order.
    pub async fn batch_jobs(&self, batch_id: &str) -> Result<Vec<String>> {
        let mut conn = self.repo.store().conn().await?;
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.repo.keys().batch_jobs(batch_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }
}
