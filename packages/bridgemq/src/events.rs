//! Lifecycle events over the store's pub/sub.
//!
//! Most events are published from inside the atomic scripts so that the
//! event and its state transition come from the same serialized execution.
//! This module owns the record shape those scripts emit, an explicit
//! publisher for the few client-side emitters, and the subscriber that
//! turns the dedicated pub/sub connection into a typed stream.
//!
//! # Guarantees
//!
//! - Events on one channel preserve publication order (store property).
//! - Publish failures never fail a state transition: the publisher logs and
//!   swallows.
//! - Unknown fields in received payloads are ignored; unknown event names
//!   are dropped with a warning. Slow subscribers lose events, they never
//!   block the broker.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::Store;

/// Event names, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.scheduled")]
    JobScheduled,
    #[serde(rename = "job.claimed")]
    JobClaimed,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.retry")]
    JobRetry,
    #[serde(rename = "job.stalled")]
    JobStalled,
    #[serde(rename = "batch.created")]
    BatchCreated,
    #[serde(rename = "ratelimit.exceeded")]
    RateLimitExceeded,
}

/// A lifecycle event record.
///
/// The field set is versioned by accretion: receivers tolerate unknown
/// fields, senders only ever add.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event: EventKind,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
    pub job_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// `now - claimedAt` for terminal events, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<i64>,
    /// Waiter ids released by a completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Rate-limit bucket key for `ratelimit.exceeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl JobEvent {
    pub fn new(event: EventKind, timestamp: i64) -> Self {
        Self {
            event,
            timestamp,
            job_id: None,
            mesh_id: None,
            server_id: None,
            job_type: None,
            status: None,
            processing_time: None,
            triggered: None,
            reason: None,
            attempt: None,
            next_run_at: None,
            batch_id: None,
            key: None,
        }
    }
}

/// An event together with the channel it arrived on.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub channel: String,
    pub event: JobEvent,
}

/// Explicit client-side publisher.
///
/// State transitions publish from inside their scripts; this is for
/// emitters outside any transition (operational tooling, tests).
#[derive(Clone)]
pub struct EventPublisher {
    store: Store,
}

impl EventPublisher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Publish to one channel. Errors are logged and swallowed.
    pub async fn publish(&self, channel: &str, event: &JobEvent) {
        if let Err(e) = self.try_publish(channel, event).await {
            warn!(channel, error = %e, "event publish failed; continuing");
        }
    }

    /// Publish and surface the failure (code 9006) to the caller.
    pub async fn try_publish(&self, channel: &str, event: &JobEvent) -> Result<()> {
        let payload =
            serde_json::to_string(event).map_err(|e| Error::EventPublish(e.to_string()))?;
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::EventPublish(e.to_string()))?;
        Ok(())
    }
}

/// Buffer between the pub/sub pump and the consumer.
const SUBSCRIBER_BUFFER: usize = 1024;

/// Typed subscription over the dedicated pub/sub connection.
pub struct EventSubscriber {
    rx: mpsc::Receiver<ReceivedEvent>,
    shutdown: CancellationToken,
}

impl EventSubscriber {
    /// Subscribe to exact channels and/or glob patterns (`*`, `?`).
    ///
    /// Takes its own connection from the store's pub/sub client; the primary
    /// pool never multiplexes subscriptions.
    pub async fn open(store: &Store, channels: &[String], patterns: &[String]) -> Result<Self> {
        let mut pubsub = store.pubsub_conn().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let shutdown = CancellationToken::new();
        let pump_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let channel = message.get_channel_name().to_string();
                        let payload: String = match message.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(channel, error = %e, "undecodable event payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<JobEvent>(&payload) {
                            Ok(event) => {
                                // Full buffer drops the oldest pressure point:
                                // this event. Subscribers are observers, the
                                // broker never waits for them.
                                if tx.try_send(ReceivedEvent { channel, event }).is_err() {
                                    debug!("subscriber buffer full, dropping event");
                                }
                            }
                            Err(e) => {
                                warn!(channel, error = %e, "unknown event record, dropping");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { rx, shutdown })
    }

    /// Receive the next event; `None` after [`close`](Self::close) or when
    /// the connection ends.
    pub async fn recv(&mut self) -> Option<ReceivedEvent> {
        self.rx.recv().await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::JobCreated).unwrap(),
            r#""job.created""#
        );
        assert_eq!(
            serde_json::to_string(&EventKind::RateLimitExceeded).unwrap(),
            r#""ratelimit.exceeded""#
        );
        let kind: EventKind = serde_json::from_str(r#""job.stalled""#).unwrap();
        assert_eq!(kind, EventKind::JobStalled);
    }

    #[test]
    fn test_event_serializes_sparse() {
        let mut event = JobEvent::new(EventKind::JobClaimed, 123);
        event.job_id = Some("j1".to_string());
        event.server_id = Some("w1".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job.claimed");
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["serverId"], "w1");
        assert!(json.get("reason").is_none());
        assert!(json.get("processingTime").is_none());
    }

    #[test]
    fn test_event_tolerates_unknown_fields() {
        let event: JobEvent = serde_json::from_str(
            r#"{"event":"job.completed","timestamp":9,"jobId":"j","processingTime":40,"futureField":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(event.event, EventKind::JobCompleted);
        assert_eq!(event.processing_time, Some(40));
    }

    #[test]
    fn test_script_emitted_shape_decodes() {
        // Exactly what complete_job.lua publishes.
        let raw = r#"{"event":"job.failed","jobId":"j9","timestamp":1700000000000,"meshId":"m","type":"encode","status":"failed","reason":"retry_limit_exceeded","attempt":3}"#;
        let event: JobEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event, EventKind::JobFailed);
        assert_eq!(event.reason.as_deref(), Some("retry_limit_exceeded"));
        assert_eq!(event.attempt, Some(3));
    }
}
