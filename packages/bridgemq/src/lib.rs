//! # BridgeMQ
//!
//! A distributed task-queue broker backed by a single shared Redis store:
//! producers enqueue jobs, workers claim and execute them with at-most-one
//! concurrent execution per job, and background loops promote delayed work,
//! recover stalls, and reap old state.
//!
//! ## Architecture
//!
//! ```text
//! Producer                         Worker (per process)
//!    │ create_job ─────────┐          │ tick ─► claim_job ──┐
//!    ▼                     │          ▼                     │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Redis (the store)                        │
//! │  job:{id}:*   queue:{mesh}:{type}:p{prio}   pending:{mesh}   │
//! │  delayed      active:{server}   dlq:{mesh}  events:* (pubsub)│
//! │         ▲ every multi-key write is one Lua script ▲          │
//! └──────────────────────────────────────────────────────────────┘
//!    ▲              ▲                  ▲
//!    │ promote      │ detect-stalled   │ clean
//!    └──────── maintenance loops (any process) ─────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. A job occupies exactly one queue position (delayed set, one priority
//!    queue, one active map, or the DLQ) and none once terminal.
//! 2. `status = active` iff the job sits in its owner's active map and
//!    `processedBy` names that owner.
//! 3. Waiter and dependency sets are exact inverses of each other.
//! 4. `attempt` never exceeds `retry.maxAttempts`; equality happens only at
//!    the moment the job is dead-lettered.
//! 5. The pending index mirrors the union of the priority queues.
//!
//! These hold because every mutation that crosses a key boundary runs as a
//! single server-side script; the store's whole-script atomicity is the only
//! synchronization primitive in the system.
//!
//! ## Guarantees
//!
//! - **At-most-one concurrent execution** per job (claim is atomic).
//! - **At-least-once execution** overall: retries and stall recovery re-run
//!   handlers, so side effects need idempotency.
//! - **No strict FIFO across priorities**: 10 claims before 1, starvation of
//!   low priorities is accepted.
//! - Timing is tick-granular; the promote loop bounds scheduling precision.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bridgemq::{
//!     codec, HandlerOutcome, Job, JobContext, JobHandler, Keys, NewJob,
//!     Registry, Repository, Store, StoreConfig, SystemClock, Worker, WorkerConfig,
//! };
//!
//! struct EncodeHandler;
//!
//! #[bridgemq::async_trait]
//! impl JobHandler for EncodeHandler {
//!     async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<HandlerOutcome> {
//!         let input: EncodeInput = job.decode_payload()?;
//!         ctx.progress(50.0).await;
//!         Ok(HandlerOutcome::Success(serde_json::json!({ "frames": 1440 })))
//!     }
//! }
//!
//! let store = Store::connect(StoreConfig::new("redis://127.0.0.1")).await?;
//! let repo = Repository::new(store.clone(), Keys::default(), Arc::new(SystemClock));
//!
//! // Producer side: no registration needed.
//! repo.create_job(NewJob::new("encode", "media", codec::encode_payload(&input)?))
//!     .await?;
//!
//! // Worker side.
//! let registry = Registry::new(store, Keys::default());
//! let worker = Worker::new(repo, registry, WorkerConfig::new("w-1", "media"));
//! worker.register_handler("encode", Arc::new(EncodeHandler));
//! tokio::spawn(worker.run());
//! ```

mod batch;
mod clock;
pub mod codec;
mod config;
mod error;
mod events;
mod job;
mod keys;
mod maintenance;
mod queue;
mod ratelimit;
mod registry;
mod repository;
mod retry;
mod routing;
mod scripts;
mod store;
mod worker;

pub use batch::{BatchCoordinator, BatchInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BehaviorConfig, ChainConfig, DependenciesConfig, IdempotencyConfig, JobConfig, JobTemplate,
    LifecycleConfig, RateLimitConfig, RetryConfig, ScheduleConfig, DEFAULT_PRIORITY,
};
pub use error::{Error, Result};
pub use events::{EventKind, EventPublisher, EventSubscriber, JobEvent, ReceivedEvent};
pub use job::{Job, JobMeta, JobStatus, NewJob};
pub use keys::{fingerprint_hash, Keys, DEFAULT_NAMESPACE};
pub use maintenance::{IntervalScheduler, Maintenance, MaintenanceConfig, Scheduler};
pub use queue::{QueueCoordinates, QueueInspector, QueueStats};
pub use ratelimit::RateLimiter;
pub use registry::{MeshInfo, Registry, ServerInfo, ServerStatus, DEFAULT_SERVER_TTL_SECS};
pub use repository::{CreateReceipt, Repository};
pub use retry::{
    apply_jitter, compute_delay, is_retry_eligible, BackoffKind, JobErrorRecord,
};
pub use routing::{capability_matches, TargetMode, TargetSelector, WorkerProfile};
pub use scripts::{
    BatchFinalizeOutcome, CancelOutcome, CleanupOutcome, CompleteOutcome, CreateJobArgs,
    CreateOutcome, PromoteOutcome, RateLimitDecision, RetryOutcome, ScriptSet, StallOutcome,
};
pub use store::{Store, StoreConfig};
pub use worker::{
    HandlerOutcome, JobContext, JobHandler, Worker, WorkerConfig, WorkerEvent,
};

// Re-export the attribute handlers are written with.
pub use async_trait::async_trait;
