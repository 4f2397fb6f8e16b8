//! The job entity and its status state machine.
//!
//! Job headers live in a store field-map (`{ns}:job:{id}:meta`); the field
//! names here are the storage contract shared with the Lua scripts. The
//! payload is opaque bytes, config is a JSON blob, and queue placement is a
//! set of secondary indexes over the id: the id is the only canonical
//! reference, every queue entry merely points at it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::retry::JobErrorRecord;

/// Job lifecycle status.
///
/// Creation enters `Scheduled` (future `scheduledFor` or unsatisfied
/// dependencies) or `Pending`; claiming moves `Pending → Active`; terminal
/// states are `Completed`, `Failed` and `Cancelled`. `Batched` members are
/// parked under a batch id until the batch job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Pending,
    Active,
    Batched,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Batched => "batched",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "batched" => Ok(JobStatus::Batched),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::StorageRead(format!("unknown job status {other:?}"))),
        }
    }

    /// Terminal states hold no queue position.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Only pending and scheduled jobs may be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-loaded job: header fields plus config and payload.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub version: String,
    pub mesh_id: String,
    pub priority: u8,
    pub status: JobStatus,
    pub attempt: u32,
    pub stalled_count: u32,
    pub progress: f64,
    pub created_at: i64,
    pub scheduled_for: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    /// Worker id owning the lock; `None` when unlocked.
    pub processed_by: Option<String>,
    /// Batch this job was folded into, if any.
    pub batch_id: Option<String>,
    pub config: JobConfig,
    pub payload: Vec<u8>,
}

impl Job {
    /// Decode the payload with the canonical codec.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        crate::codec::decode_payload(&self.payload)
    }

    /// Rebuild the header from a meta field-map as returned by HGETALL.
    pub fn meta_from_map(map: &HashMap<String, String>) -> Result<JobMeta> {
        let get = |field: &str| -> Result<&String> {
            map.get(field)
                .ok_or_else(|| Error::StorageRead(format!("job meta missing field {field:?}")))
        };
        let parse_i64 = |field: &str| -> Result<i64> {
            get(field)?
                .parse::<i64>()
                .map_err(|_| Error::StorageRead(format!("job meta field {field:?} is not an integer")))
        };
        let opt_i64 = |field: &str| -> Result<Option<i64>> {
            match map.get(field).map(String::as_str) {
                None | Some("") | Some("0") => Ok(None),
                Some(v) => v
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| Error::StorageRead(format!("job meta field {field:?} is not an integer"))),
            }
        };

        Ok(JobMeta {
            id: get("id")?.clone(),
            job_type: get("type")?.clone(),
            version: map.get("version").cloned().unwrap_or_default(),
            mesh_id: get("meshId")?.clone(),
            priority: parse_i64("priority")? as u8,
            status: JobStatus::parse(get("status")?)?,
            attempt: parse_i64("attempt")? as u32,
            stalled_count: map
                .get("stalledCount")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0),
            progress: map
                .get("progress")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0),
            created_at: parse_i64("createdAt")?,
            scheduled_for: parse_i64("scheduledFor")?,
            claimed_at: opt_i64("claimedAt")?,
            completed_at: opt_i64("completedAt")?,
            updated_at: parse_i64("updatedAt")?,
            processed_by: map
                .get("processedBy")
                .filter(|v| !v.is_empty())
                .cloned(),
            batch_id: map.get("batchId").filter(|v| !v.is_empty()).cloned(),
        })
    }
}

/// Header fields only, as stored in the meta field-map.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub id: String,
    pub job_type: String,
    pub version: String,
    pub mesh_id: String,
    pub priority: u8,
    pub status: JobStatus,
    pub attempt: u32,
    pub stalled_count: u32,
    pub progress: f64,
    pub created_at: i64,
    pub scheduled_for: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub processed_by: Option<String>,
    pub batch_id: Option<String>,
}

impl JobMeta {
    /// Combine a header with its config and payload into a full [`Job`].
    pub fn into_job(self, config: JobConfig, payload: Vec<u8>) -> Job {
        Job {
            id: self.id,
            job_type: self.job_type,
            version: self.version,
            mesh_id: self.mesh_id,
            priority: self.priority,
            status: self.status,
            attempt: self.attempt,
            stalled_count: self.stalled_count,
            progress: self.progress,
            created_at: self.created_at,
            scheduled_for: self.scheduled_for,
            claimed_at: self.claimed_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            processed_by: self.processed_by,
            batch_id: self.batch_id,
            config,
            payload,
        }
    }
}

/// Everything needed to create a job.
///
/// `job_id` defaults to a fresh UUID; `scheduled_for` is resolved from
/// `config.schedule` against the caller's clock at submit time.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Option<String>,
    pub job_type: String,
    pub version: String,
    pub mesh_id: String,
    pub payload: Vec<u8>,
    pub config: JobConfig,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, mesh_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            job_id: None,
            job_type: job_type.into(),
            version: String::new(),
            mesh_id: mesh_id.into(),
            payload,
            config: JobConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Deserialize the bounded error history list (newest first).
pub fn parse_error_history(raw: &[String]) -> Vec<JobErrorRecord> {
    raw.iter()
        .filter_map(|entry| serde_json::from_str(entry).ok())
        .collect()
}
