use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;
use crate::queue::store::QueueStore;

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, String>,
    ttls: HashMap<String, Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

/// In-process queue store with the same semantics as the Redis backend.
///
/// Clones share state, so several "workers" in one process (or a test and
/// the worker under test) observe the same queues. Expiry is recorded but
/// not enforced.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Last expiry armed on `key`, if any.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.state().ttls.get(key).copied()
    }

    pub fn len(&self, key: &str) -> usize {
        self.state().lists.get(key).map_or(0, VecDeque::len)
    }

    fn try_pop_push(&self, source: &str, destination: &str) -> Option<String> {
        let mut state = self.state();
        let value = state.lists.get_mut(source)?.pop_back()?;
        state
            .lists
            .entry(destination.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }

    fn try_pop_front(&self, key: &str) -> Option<String> {
        self.state().lists.get_mut(key)?.pop_front()
    }

    /// Retry `attempt` whenever the store changes, until it yields or
    /// `timeout` passes.
    async fn wait_for<F>(&self, timeout: Duration, mut attempt: F) -> Option<String>
    where
        F: FnMut() -> Option<String>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(value) = attempt() {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn pop_push_blocking(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        Ok(self
            .wait_for(timeout, || self.try_pop_push(source, destination))
            .await)
    }

    async fn pop_front_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        Ok(self.wait_for(timeout, || self.try_pop_front(key)).await)
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        Ok(self.try_pop_front(key))
    }

    async fn push_front(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        {
            let mut state = self.state();
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
            if let Some(ttl) = ttl {
                state.ttls.insert(key.to_string(), ttl);
            }
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize> {
        let mut state = self.state();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok(before - list.len())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().values.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.lists.remove(key);
        state.values.remove(key);
        state.ttls.remove(key);
        Ok(())
    }

    async fn dedicated(&self) -> Result<Arc<dyn QueueStore>> {
        Ok(Arc::new(self.clone()))
    }
}
