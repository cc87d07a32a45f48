use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{QueueError, QueueResult};

/// Bounded Redis connection pool.
///
/// At most `max_active` connections are checked out at once. Further
/// checkouts wait for a return, up to the optional checkout timeout.
pub struct RedisPool {
    client: redis::Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
    max_active: usize,
    checkout_timeout: Option<Duration>,
}

impl RedisPool {
    pub fn new(url: &str, max_active: usize) -> QueueResult<Self> {
        if max_active == 0 {
            return Err(QueueError::config("max_active must be at least 1"));
        }
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::config(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_active)),
            max_active,
            checkout_timeout: None,
        })
    }

    /// Give up on a checkout after `timeout` with a transient error
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = Some(timeout);
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Connections currently checked out
    pub fn active(&self) -> usize {
        self.max_active - self.permits.available_permits()
    }

    pub async fn get(&self) -> QueueResult<PooledConnection<'_>> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.checkout_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| QueueError::BrokerUnavailable("connection pool exhausted".to_string()))?,
            None => acquire.await,
        }
        .map_err(|_| QueueError::Internal("connection pool closed".to_string()))?;

        let cached = self.idle.lock().pop();
        let conn = match cached {
            Some(conn) => conn,
            None => {
                debug!(active = self.active(), "Opening redis connection");
                self.client.get_multiplexed_async_connection().await?
            }
        };

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        })
    }
}

/// A checked-out connection, returned to the pool on drop
pub struct PooledConnection<'a> {
    pool: &'a RedisPool,
    conn: Option<MultiplexedConnection>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection<'_> {
    /// Convert a command result, discarding the connection on transport failure
    pub fn settle<T>(&mut self, result: redis::RedisResult<T>) -> QueueResult<T> {
        result.map_err(|err| {
            let err = QueueError::from(err);
            if err.is_transient() {
                self.broken = true;
            }
            err
        })
    }
}

impl Deref for PooledConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}
