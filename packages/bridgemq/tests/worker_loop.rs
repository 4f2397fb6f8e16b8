//! Worker-loop and event-bus scenarios against a live store.
//!
//! Compiled only with `--features test-redis`. Unlike the script-level
//! scenarios these run on the wall clock, because the worker's tick and
//! heartbeat timers do.

#![cfg(feature = "test-redis")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridgemq::{
    codec, EventKind, EventSubscriber, HandlerOutcome, Job, JobConfig, JobContext, JobErrorRecord,
    JobHandler, JobStatus, Keys, NewJob, Registry, Repository, ServerStatus, Store, StoreConfig,
    SystemClock, Worker, WorkerConfig, WorkerEvent,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    n: i64,
}

async fn setup() -> (Store, Repository, Keys) {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = Store::connect(StoreConfig::new(url)).await.expect("store");
    let keys = Keys::new(format!("bridgemq-wtest-{}", Uuid::new_v4().simple()));
    let repo = Repository::new(store.clone(), keys.clone(), Arc::new(SystemClock));
    (store, repo, keys)
}

struct Doubler;

#[bridgemq::async_trait]
impl JobHandler for Doubler {
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<HandlerOutcome> {
        let payload: Payload = job.decode_payload()?;
        ctx.progress(100.0).await;
        Ok(HandlerOutcome::Success(
            serde_json::json!({ "doubled": payload.n * 2 }),
        ))
    }
}

struct FailOnce {
    failures: AtomicU32,
}

#[bridgemq::async_trait]
impl JobHandler for FailOnce {
    async fn handle(&self, _job: Job, ctx: JobContext) -> anyhow::Result<HandlerOutcome> {
        if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(HandlerOutcome::Retry(JobErrorRecord::new(
                7100,
                "flaky",
                ctx.now_ms(),
            )))
        } else {
            Ok(HandlerOutcome::Success(serde_json::Value::Null))
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_executes_and_stores_results() {
    let (store, repo, keys) = setup().await;
    let registry = Registry::new(store, keys);
    let mut config = WorkerConfig::new("w-loop-1", "m");
    config.concurrency = 2;
    let worker = Worker::new(repo.clone(), registry, config);
    worker.register_handler("double", Arc::new(Doubler));
    let mut events = worker.subscribe();

    let handle = tokio::spawn(worker.clone().run());

    let receipt = repo
        .create_job(
            NewJob::new("double", "m", codec::encode_payload(&Payload { n: 21 }).unwrap())
                .with_config(JobConfig::default()),
        )
        .await
        .unwrap();

    // Wait for the completion event for our job.
    let completed = timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                WorkerEvent::JobComplete { job_id, .. } if job_id == receipt.job_id => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(completed.is_ok(), "job did not complete in time");

    let meta = repo.get_meta(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Completed);
    assert!((meta.progress - 100.0).abs() < f64::EPSILON);
    let result = repo.get_result(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(result["doubled"], 42);

    worker.shutdown_token().cancel();
    timeout(Duration::from_secs(10), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_outcome_reschedules_and_eventually_succeeds() {
    let (store, repo, keys) = setup().await;
    let registry = Registry::new(store, keys);
    let config = WorkerConfig::new("w-loop-2", "m");
    let worker = Worker::new(repo.clone(), registry, config);
    worker.register_handler(
        "flaky",
        Arc::new(FailOnce {
            failures: AtomicU32::new(0),
        }),
    );
    let handle = tokio::spawn(worker.clone().run());

    // Tight backoff so the retry lands inside the test budget.
    let job_config: JobConfig = serde_json::from_value(serde_json::json!({
        "retry": { "maxAttempts": 3, "backoff": "fixed", "baseDelayMs": 200, "jitterFactor": 0.0 }
    }))
    .unwrap();
    let receipt = repo
        .create_job(
            NewJob::new("flaky", "m", codec::encode_payload(&Payload { n: 1 }).unwrap())
                .with_config(job_config),
        )
        .await
        .unwrap();

    // The worker retries through the delayed set, so drive the promote loop.
    let done = timeout(Duration::from_secs(15), async {
        loop {
            let _ = repo.process_delayed(100).await;
            if let Some(meta) = repo.get_meta(&receipt.job_id).await.unwrap() {
                if meta.status == JobStatus::Completed {
                    break meta;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("job did not recover in time");
    assert_eq!(done.attempt, 1);

    let errors = repo.get_errors(&receipt.job_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, 7100);

    worker.shutdown_token().cancel();
    timeout(Duration::from_secs(10), handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_registers_and_deregisters_its_server() {
    let (store, repo, keys) = setup().await;
    let registry = Registry::new(store.clone(), keys.clone());
    let config = WorkerConfig::new("w-loop-3", "m");
    let worker = Worker::new(repo, Registry::new(store, keys), config);
    let handle = tokio::spawn(worker.clone().run());

    // Registration happens before the first tick.
    let registered = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(info) = registry.get_server("w-loop-3").await.unwrap() {
                break info;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("server never registered");
    assert_eq!(registered.status, ServerStatus::Online);
    assert_eq!(registered.mesh_ids, vec!["m"]);

    let mesh = registry.get_mesh("m").await.unwrap().expect("mesh auto-created");
    assert_eq!(mesh.id, "m");

    worker.shutdown_token().cancel();
    timeout(Duration::from_secs(10), handle).await.unwrap().unwrap().unwrap();
    assert!(registry.get_server("w-loop-3").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_sees_lifecycle_events_by_pattern() {
    let (store, repo, keys) = setup().await;
    let mut subscriber = EventSubscriber::open(
        &store,
        &[],
        &[format!("{}:events:*", keys.namespace())],
    )
    .await
    .unwrap();

    let receipt = repo
        .create_job(NewJob::new(
            "observed",
            "m",
            codec::encode_payload(&Payload { n: 1 }).unwrap(),
        ))
        .await
        .unwrap();

    // job.created fans out to global, mesh and type channels.
    let mut channels = Vec::new();
    let collected = timeout(Duration::from_secs(5), async {
        while channels.len() < 3 {
            let received = subscriber.recv().await.unwrap();
            assert_eq!(received.event.event, EventKind::JobCreated);
            assert_eq!(received.event.job_id.as_deref(), Some(receipt.job_id.as_str()));
            channels.push(received.channel);
        }
    })
    .await;
    assert!(collected.is_ok(), "expected three created events, got {channels:?}");

    channels.sort();
    assert_eq!(
        channels,
        vec![
            keys.events_global(),
            keys.events_mesh("m"),
            keys.events_type("observed"),
        ]
    );
}
