//! Store driver: pooled connections, reconnect policy, pub/sub split.
//!
//! The store is the sole synchronization point of the whole broker, so this
//! module is deliberately small: a deadpool-backed connection pool with an
//! acquire deadline, a capped-and-jittered connect retry loop, a keep-warm
//! health probe, and a separate client for pub/sub subscriptions (subscribe
//! never multiplexes onto the primary pool).

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Connections the health probe keeps warm.
    pub pool_min: usize,
    /// Hard cap on pooled connections.
    pub pool_max: usize,
    /// Deadline for acquiring a pooled connection.
    pub acquire_timeout: Duration,
    /// Attempts before initial connect gives up.
    pub connect_retries: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Period of the keep-warm probe.
    pub health_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_min: 2,
            pool_max: 16,
            acquire_timeout: Duration::from_millis(3_000),
            connect_retries: 5,
            reconnect_base: Duration::from_millis(200),
            reconnect_max: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Handle to the shared store.
///
/// Cheap to clone; all clones share the pool and the pub/sub client.
#[derive(Clone)]
pub struct Store {
    pool: deadpool_redis::Pool,
    pubsub_client: redis::Client,
    config: StoreConfig,
}

impl Store {
    /// Build the pool and verify connectivity.
    ///
    /// The initial PING retries with capped exponential backoff and ±20%
    /// jitter; after `connect_retries` failures the last error surfaces as a
    /// fatal storage error.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let mut pool_config = deadpool_redis::Config::from_url(&config.url);
        let mut managed = deadpool_redis::PoolConfig::new(config.pool_max);
        managed.timeouts.wait = Some(config.acquire_timeout);
        pool_config.pool = Some(managed);

        let pool = pool_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| Error::InvalidConfig(format!("store url rejected: {e}")))?;

        let pubsub_client =
            redis::Client::open(config.url.as_str()).map_err(Error::Storage)?;

        let store = Self {
            pool,
            pubsub_client,
            config,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match store.ping().await {
                Ok(()) => {
                    info!(attempt, "store connected");
                    return Ok(store);
                }
                Err(e) if attempt >= store.config.connect_retries => {
                    warn!(attempt, error = %e, "store connect exhausted retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = store.reconnect_delay(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "store connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Acquire a pooled connection, bounded by the acquire timeout.
    pub async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_redis::PoolError::Timeout(_) => Error::PoolExhausted,
            deadpool_redis::PoolError::Backend(e) => Error::Storage(e),
            other => Error::StorageRead(other.to_string()),
        })
    }

    /// A fresh pub/sub connection from the dedicated client.
    pub async fn pubsub_conn(&self) -> Result<redis::aio::PubSub> {
        self.pubsub_client
            .get_async_pubsub()
            .await
            .map_err(Error::Storage)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::StorageRead(format!("unexpected PING reply {pong:?}")))
        }
    }

    /// Periodically validates and tops the pool back up to `pool_min`.
    ///
    /// Dead connections are recycled by the pool on check-out; the probe's
    /// job is to keep that recycling from happening on the claim path.
    pub fn spawn_health_probe(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.health_interval);
            interval.tick().await; // fires immediately otherwise
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let mut warm = Vec::with_capacity(store.config.pool_min);
                        for _ in 0..store.config.pool_min {
                            match store.conn().await {
                                Ok(mut conn) => {
                                    match redis::cmd("PING").query_async::<String>(&mut conn).await {
                                        Ok(_) => warm.push(conn),
                                        Err(e) => warn!(error = %e, "health probe evicting dead connection"),
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "health probe could not acquire connection");
                                    break;
                                }
                            }
                        }
                        debug!(warm = warm.len(), "health probe pass complete");
                        drop(warm);
                    }
                }
            }
        })
    }

    /// Capped exponential backoff with ±20% jitter.
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let base = self
            .config
            .reconnect_base
            .as_millis()
            .saturating_mul(1u128 << shift);
        let capped = base.min(self.config.reconnect_max.as_millis()) as f64;
        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        Duration::from_millis((capped * (1.0 + jitter)).max(1.0) as u64)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("url", &self.config.url)
            .field("pool_max", &self.config.pool_max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.pool_min, 2);
        assert_eq!(config.pool_max, 16);
        assert_eq!(config.acquire_timeout, Duration::from_millis(3_000));
        assert_eq!(config.connect_retries, 5);
    }

    #[tokio::test]
    async fn test_reconnect_delay_caps_and_jitters() {
        let store = Store {
            pool: deadpool_redis::Config::from_url("redis://127.0.0.1:1")
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .unwrap(),
            pubsub_client: redis::Client::open("redis://127.0.0.1:1").unwrap(),
            config: StoreConfig::default(),
        };

        for attempt in 1..10 {
            let delay = store.reconnect_delay(attempt);
            // Cap is 5s; +20% jitter allows up to 6s.
            assert!(delay <= Duration::from_millis(6_000), "attempt {attempt}: {delay:?}");
            assert!(delay >= Duration::from_millis(1));
        }

        // First attempt stays within ±20% of the base delay.
        let first = store.reconnect_delay(1).as_millis() as i64;
        assert!((160..=240).contains(&first), "{first}");
    }

    #[test]
    fn test_bad_url_is_invalid_config() {
        let mut pool_config = deadpool_redis::Config::from_url("not a url");
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(1));
        let result = pool_config.create_pool(Some(deadpool_redis::Runtime::Tokio1));
        assert!(result.is_err());
    }
}
