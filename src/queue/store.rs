use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::error::Result;

/// List and key primitives the queue protocol is built from.
///
/// Lists follow Redis orientation: "front" is the left end. Producers push to
/// the front and consumers take from the back, so lists behave as FIFOs.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically move the back element of `source` to the front of
    /// `destination`, waiting up to `timeout` for one to appear.
    async fn pop_push_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Take the front element of `key`, waiting up to `timeout`.
    async fn pop_front_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Take the front element of `key` without waiting.
    async fn pop_front(&self, key: &str) -> Result<Option<String>>;

    /// Push to the front of `key`; with `ttl`, (re)arm the key's expiry in the
    /// same atomic step.
    async fn push_front(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove every occurrence of `value` from `key`; returns how many went.
    async fn remove(&self, key: &str, value: &str) -> Result<usize>;

    /// Whole list, front first.
    async fn range(&self, key: &str) -> Result<Vec<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// A handle on its own connection, for callers that park in blocking
    /// pops while others keep writing.
    async fn dedicated(&self) -> Result<Arc<dyn QueueStore>>;
}

/// Blocking commands take whole seconds; zero would block forever.
fn blocking_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

/// Production backend on a Redis server.
///
/// Every reply, blocking pops included, must arrive within
/// `response_timeout`; a half-open connection then surfaces as an error
/// instead of hanging the caller.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    response_timeout: Duration,
}

impl RedisStore {
    /// `response_timeout` must exceed the longest blocking pop issued
    /// through this store.
    pub async fn connect(url: &str, response_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = manager(&client, response_timeout).await?;
        tracing::debug!(?response_timeout, "Connected to queue store");
        Ok(Self {
            client,
            conn,
            response_timeout,
        })
    }
}

async fn manager(client: &redis::Client, response_timeout: Duration) -> Result<ConnectionManager> {
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(response_timeout)
        .set_response_timeout(response_timeout);
    Ok(ConnectionManager::new_with_config(client.clone(), config).await?)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn pop_push_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(blocking_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn pop_front_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(blocking_secs(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(popped)
    }

    async fn push_front(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("LPUSH").arg(key).arg(value).ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn dedicated(&self) -> Result<Arc<dyn QueueStore>> {
        let conn = manager(&self.client, self.response_timeout).await?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            conn,
            response_timeout: self.response_timeout,
        }))
    }
}
