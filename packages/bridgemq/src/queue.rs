//! Queue topology helpers.
//!
//! Per `(meshId, type, priority)` there is one priority queue sorted by the
//! earliest-eligible timestamp; the per-mesh pending index mirrors the union
//! of those queues for cheap aggregate queries. Claim iterates priorities
//! 10 down to 1 and, within a priority, earliest score first: FIFO modulo retry
//! re-insertion. Lower priorities can starve; that is the accepted
//! trade-off, an external aging job may re-score old entries.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::repository::Repository;

/// Identifies one priority queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueCoordinates {
    pub mesh_id: String,
    pub job_type: String,
    pub priority: u8,
}

impl QueueCoordinates {
    pub fn new(mesh_id: impl Into<String>, job_type: impl Into<String>, priority: u8) -> Self {
        Self {
            mesh_id: mesh_id.into(),
            job_type: job_type.into(),
            priority,
        }
    }

    /// The `type:priority` tuple stored in the per-mesh queue registry set.
    pub fn tuple(&self) -> String {
        format!("{}:{}", self.job_type, self.priority)
    }

    /// Parse a registry tuple back into coordinates.
    ///
    /// The split is at the last colon: job types cannot contain `:`, so the
    /// suffix is always the priority.
    pub fn parse_tuple(mesh_id: &str, tuple: &str) -> Result<Self> {
        let (job_type, priority) = tuple
            .rsplit_once(':')
            .ok_or_else(|| Error::StorageRead(format!("malformed queue tuple {tuple:?}")))?;
        let priority: u8 = priority
            .parse()
            .map_err(|_| Error::StorageRead(format!("malformed queue tuple {tuple:?}")))?;
        Ok(Self::new(mesh_id, job_type, priority))
    }
}

/// Aggregate snapshot of one mesh's queues.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Depth per `(type, priority)` queue.
    pub depths: HashMap<(String, u8), u64>,
    /// Size of the pending index.
    pub pending: u64,
    /// Dead-letter length.
    pub dlq: u64,
    /// Terminal counters: completed / failed / cancelled.
    pub totals: HashMap<String, u64>,
}

/// Read-only aggregate queries over the topology.
#[derive(Debug, Clone)]
pub struct QueueInspector {
    repo: Repository,
}

impl QueueInspector {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Populated queue coordinates for a mesh, from the registry set.
    pub async fn populated_queues(&self, mesh_id: &str) -> Result<Vec<QueueCoordinates>> {
        let mut conn = self.repo.store().conn().await?;
        let tuples: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.repo.keys().queues(mesh_id))
            .query_async(&mut conn)
            .await?;
        let mut coordinates = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            coordinates.push(QueueCoordinates::parse_tuple(mesh_id, &tuple)?);
        }
        coordinates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.job_type.cmp(&b.job_type))
        });
        Ok(coordinates)
    }

    /// Full depth/pending/DLQ/totals snapshot for a mesh.
    pub async fn stats(&self, mesh_id: &str) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for coordinates in self.populated_queues(mesh_id).await? {
            let depth = self
                .repo
                .queue_depth(mesh_id, &coordinates.job_type, coordinates.priority)
                .await?;
            stats
                .depths
                .insert((coordinates.job_type, coordinates.priority), depth);
        }
        stats.pending = self.repo.pending_count(mesh_id).await?;

        let mut conn = self.repo.store().conn().await?;
        stats.dlq = redis::cmd("LLEN")
            .arg(self.repo.keys().dlq(mesh_id))
            .query_async(&mut conn)
            .await?;
        drop(conn);

        stats.totals = self.repo.mesh_totals(mesh_id).await?;
        Ok(stats)
    }

    /// Global delayed-set size.
    pub async fn delayed_count(&self) -> Result<u64> {
        let mut conn = self.repo.store().conn().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.repo.keys().delayed())
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
