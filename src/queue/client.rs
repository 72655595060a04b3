use std::sync::Arc;
use std::time::Duration;

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::queue::names::{JobChannels, QueueNames};
use crate::queue::store::QueueStore;
use crate::task::{Job, StatusUpdate};

/// Runner-side view of the shared job queue.
///
/// Every blocking call is bounded by `poll_timeout` and re-polled in a loop,
/// so the loops stay responsive to cancellation even against a store that
/// never answers. Connectivity errors while polling are logged and retried
/// after `retry_backoff`.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn QueueStore>,
    names: QueueNames,
    poll_timeout: Duration,
    retry_backoff: Duration,
    progress_ttl: Duration,
}

impl QueueClient {
    pub fn new(store: Arc<dyn QueueStore>, config: &RunnerConfig) -> Self {
        Self {
            store,
            names: QueueNames::new(config.queue.prefix.clone(), config.identity()),
            poll_timeout: config.poll_timeout(),
            retry_backoff: config.retry_backoff(),
            progress_ttl: config.task_timeout(),
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn channels(&self, job_id: &str) -> JobChannels {
        self.names.job(job_id)
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// A client identical to this one but on its own store connection.
    pub async fn dedicated(&self) -> Result<Self> {
        Ok(Self {
            store: self.store.dedicated().await?,
            ..self.clone()
        })
    }

    /// Forget jobs a previous incarnation of this runner had claimed.
    ///
    /// Recovering them is the scheduler's business; they are only dropped
    /// from the marker so they are not mistaken for current work.
    pub async fn reset_in_progress(&self) -> Result<()> {
        let key = self.names.in_progress();
        let stale = self.store.range(&key).await?;
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), jobs = ?stale, "Dropping stale in-progress markers");
        }
        self.store.delete(&key).await
    }

    /// Block until a job is claimed from the pending queue.
    ///
    /// The id is moved into this runner's in-progress marker atomically, so a
    /// job is delivered to at most one runner. The payload is consumed and
    /// decoded afterwards; a missing or malformed payload is returned as the
    /// error half so the caller can still report against the id.
    pub async fn dequeue_next(&self) -> (String, Result<Job>) {
        let pending = self.names.pending();
        let in_progress = self.names.in_progress();
        loop {
            match self
                .store
                .pop_push_blocking(&pending, &in_progress, self.poll_timeout)
                .await
            {
                Ok(Some(job_id)) => {
                    tracing::debug!(job_id = %job_id, "Claimed job");
                    let job = self.take_payload(&job_id).await;
                    return (job_id, job);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Polling pending queue failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn take_payload(&self, job_id: &str) -> Result<Job> {
        let channels = self.names.job(job_id);
        let payload = self
            .store
            .pop_front(&channels.payload)
            .await?
            .ok_or_else(|| RunnerError::PayloadMissing(job_id.to_string()))?;
        Job::from_json(&payload)
    }

    /// Append `update` to the job's progress channel and re-arm its expiry.
    pub async fn push_progress(&self, job_id: &str, update: &StatusUpdate) -> Result<()> {
        let channels = self.names.job(job_id);
        let encoded = serde_json::to_string(update)?;
        self.store
            .push_front(&channels.progress, &encoded, Some(self.progress_ttl))
            .await
    }

    /// Resolve once an abort marker for `job_id` has been consumed.
    ///
    /// Never returns otherwise; callers race it against the work it guards.
    pub async fn listen_abort(&self, job_id: &str) {
        let channels = self.names.job(job_id);
        loop {
            match self
                .store
                .pop_front_blocking(&channels.abort, self.poll_timeout)
                .await
            {
                Ok(Some(_)) => {
                    tracing::info!(job_id = %job_id, "Abort requested");
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Polling abort channel failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    /// Drop the job from the in-progress marker. Failures are only logged.
    pub async fn complete(&self, job_id: &str) {
        match self.store.remove(&self.names.in_progress(), job_id).await {
            Ok(0) => {
                tracing::warn!(job_id = %job_id, "Job was not in the in-progress marker");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to clear in-progress marker");
            }
        }
    }

    pub async fn heartbeat(&self, timestamp: f64) -> Result<()> {
        self.store
            .set(&self.names.heartbeat(), &timestamp.to_string())
            .await
    }

    pub async fn last_heartbeat(&self) -> Result<Option<f64>> {
        let raw = self.store.get(&self.names.heartbeat()).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    // Scheduler side. The runner never calls these; the operator CLI and the
    // tests use them to drive the protocol from the other end.

    /// Store the payload, then make the id visible on the pending queue.
    pub async fn enqueue(&self, job_id: &str, job: &Job) -> Result<()> {
        let channels = self.names.job(job_id);
        self.store.delete(&channels.payload).await?;
        self.store
            .push_front(&channels.payload, &job.to_json()?, Some(self.progress_ttl))
            .await?;
        self.store
            .push_front(&self.names.pending(), job_id, None)
            .await
    }

    pub async fn request_abort(&self, job_id: &str) -> Result<()> {
        let channels = self.names.job(job_id);
        self.store
            .push_front(&channels.abort, "1", Some(self.progress_ttl))
            .await
    }

    /// Progress updates of `job_id`, oldest first.
    pub async fn progress(&self, job_id: &str) -> Result<Vec<StatusUpdate>> {
        let channels = self.names.job(job_id);
        let mut raw = self.store.range(&channels.progress).await?;
        raw.reverse();
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(RunnerError::from))
            .collect()
    }

    /// Ids this runner currently holds in its in-progress marker.
    pub async fn in_progress(&self) -> Result<Vec<String>> {
        self.store.range(&self.names.in_progress()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryStore;
    use crate::task::{JudgeResult, JudgeStatus, Lane};

    fn client(store: &MemoryStore) -> QueueClient {
        let mut config = RunnerConfig::new(1, "test");
        config.poll_timeout_secs = 1;
        config.retry_backoff_ms = 10;
        QueueClient::new(Arc::new(store.clone()), &config)
    }

    fn job() -> Job {
        Job::from_json(
            r#"{"submission_id": "s1", "lane": {"language": "cpp", "source": "http://x/a.cpp"}}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dequeue_moves_job_into_in_progress() {
        let store = MemoryStore::new();
        let client = client(&store);
        client.enqueue("t1", &job()).await.unwrap();

        let (id, decoded) = client.dequeue_next().await;
        assert_eq!(id, "t1");
        assert_eq!(decoded.unwrap().submission_id, "s1");
        assert_eq!(client.in_progress().await.unwrap(), vec!["t1"]);
        // payload is consumed once
        assert_eq!(store.len(&client.channels("t1").payload), 0);
    }

    #[tokio::test]
    async fn dequeue_reports_missing_payload_with_id() {
        let store = MemoryStore::new();
        let client = client(&store);
        store
            .push_front(&client.names().pending(), "ghost", None)
            .await
            .unwrap();

        let (id, decoded) = client.dequeue_next().await;
        assert_eq!(id, "ghost");
        assert!(matches!(decoded, Err(RunnerError::PayloadMissing(_))));
    }

    #[tokio::test]
    async fn progress_is_ordered_and_expires() {
        let store = MemoryStore::new();
        let client = client(&store);
        client
            .push_progress("t1", &StatusUpdate::Started)
            .await
            .unwrap();
        client
            .push_progress(
                "t1",
                &StatusUpdate::Done {
                    result: JudgeResult::verdict(JudgeStatus::Accepted, "ok"),
                },
            )
            .await
            .unwrap();

        let updates = client.progress("t1").await.unwrap();
        assert_eq!(updates[0], StatusUpdate::Started);
        assert!(updates[1].is_terminal());
        assert_eq!(
            store.ttl(&client.channels("t1").progress),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn abort_is_consumed_once() {
        let store = MemoryStore::new();
        let client = client(&store);
        client.request_abort("t1").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), client.listen_abort("t1"))
            .await
            .unwrap();
        assert_eq!(store.len(&client.channels("t1").abort), 0);
    }

    #[tokio::test]
    async fn reset_clears_only_own_marker() {
        let store = MemoryStore::new();
        let mine = client(&store);
        let mut other_config = RunnerConfig::new(2, "test");
        other_config.poll_timeout_secs = 1;
        let other = QueueClient::new(Arc::new(store.clone()), &other_config);

        store
            .push_front(&mine.names().in_progress(), "old", None)
            .await
            .unwrap();
        store
            .push_front(&other.names().in_progress(), "theirs", None)
            .await
            .unwrap();

        mine.reset_in_progress().await.unwrap();
        assert!(mine.in_progress().await.unwrap().is_empty());
        assert_eq!(other.in_progress().await.unwrap(), vec!["theirs"]);
    }

    #[tokio::test]
    async fn complete_removes_marker() {
        let store = MemoryStore::new();
        let client = client(&store);
        let mut j = job();
        j.lane = Lane::Verilog {
            source: "http://x/main.v".into(),
        };
        client.enqueue("t2", &j).await.unwrap();
        let (id, _) = client.dequeue_next().await;
        client.complete(&id).await;
        assert!(client.in_progress().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_round_trips_timestamp() {
        let store = MemoryStore::new();
        let client = client(&store);
        assert!(client.last_heartbeat().await.unwrap().is_none());
        client.heartbeat(1_700_000_000.25).await.unwrap();
        assert_eq!(client.last_heartbeat().await.unwrap(), Some(1_700_000_000.25));
    }
}
