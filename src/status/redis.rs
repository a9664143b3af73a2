//! Redis-backed status store with connect-with-backoff and reconnect on
//! connection loss.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{StatusStore, StatusStoreError, parse_status};
use crate::config::StatusConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::state_machine::JobStatus;

/// Owns one multiplexed connection, re-established on demand after the
/// server drops it.
pub struct RedisStatusStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    retry: RetryPolicy,
    ttl_secs: Option<u64>,
}

impl RedisStatusStore {
    pub async fn connect(config: &StatusConfig) -> Result<Self, StatusStoreError> {
        let client = Client::open(config.redis_url.as_str())?;
        let retry = RetryPolicy::new(
            config.connect_attempts,
            Backoff::Exponential {
                unit: Duration::from_millis(config.initial_backoff_ms),
                base: 2,
            },
        );
        let connection = establish(&client, &retry).await?;
        Ok(Self {
            client,
            connection: Mutex::new(Some(connection)),
            retry,
            ttl_secs: config.ttl_secs,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StatusStoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let connection = establish(&self.client, &self.retry).await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Run a command, and run it once more on a fresh connection if the
    /// first attempt found the connection gone.
    async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, StatusStoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        match op(self.connection().await?).await {
            Ok(value) => Ok(value),
            Err(err) if connection_lost(&err) => {
                warn!(error = %err, "status store connection lost, reconnecting");
                *self.connection.lock().await = None;
                Ok(op(self.connection().await?).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn connection_lost(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

async fn establish(client: &Client, retry: &RetryPolicy) -> Result<MultiplexedConnection, StatusStoreError> {
    let mut attempt = 1;
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(connection) => {
                info!(attempt, "connected to status store");
                return Ok(connection);
            }
            Err(err) if retry.allows_retry_after(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "status store connection failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(StatusStoreError::Connect {
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn set(&self, job_id: &str, status: JobStatus) -> Result<(), StatusStoreError> {
        let value = status.as_str();
        let ttl = self.ttl_secs;
        self.with_connection(|mut con| async move {
            match ttl {
                Some(seconds) => con.set_ex::<_, _, ()>(job_id, value, seconds).await,
                None => con.set::<_, _, ()>(job_id, value).await,
            }
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>, StatusStoreError> {
        let raw: Option<String> = self
            .with_connection(|mut con| async move { con.get(job_id).await })
            .await?;
        raw.map(|value| parse_status(job_id, value)).transpose()
    }

    async fn delete(&self, job_id: &str) -> Result<(), StatusStoreError> {
        self.with_connection(|mut con| async move { con.del::<_, ()>(job_id).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        let config = StatusConfig {
            // Nothing listens on port 1.
            redis_url: "redis://127.0.0.1:1/0".into(),
            connect_attempts: 2,
            initial_backoff_ms: 0,
            ttl_secs: None,
        };

        let err = RedisStatusStore::connect(&config).await.err().unwrap();

        assert!(matches!(err, StatusStoreError::Connect { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_connecting() {
        let config = StatusConfig {
            redis_url: "not a url".into(),
            ..StatusConfig::default()
        };

        let err = RedisStatusStore::connect(&config).await.err().unwrap();

        assert!(matches!(err, StatusStoreError::Command(_)));
    }

    #[test]
    fn refused_connections_count_as_lost() {
        let err = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(connection_lost(&err));
        let err = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!connection_lost(&err));
    }
}
