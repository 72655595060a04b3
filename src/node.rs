use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::CacheSweeper;
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::queue::{QueueClient, QueueStore, RedisStore};
use crate::worker::{HeartbeatSender, JobRunner, Judge, Pipeline};

/// One runner process: the main loop plus its background loops.
pub struct Node {
    pub config: Arc<RunnerConfig>,
    pub queue: QueueClient,
    pub judge: Arc<dyn Judge>,
}

impl Node {
    /// Production wiring: Redis queue store and the full stage pipeline.
    pub async fn connect(config: RunnerConfig) -> Result<Self> {
        let store = RedisStore::connect(&config.queue.url, config.queue_response_timeout()).await?;
        let judge = Pipeline::new(&config)?;
        Ok(Self::new(config, Arc::new(store), Arc::new(judge)))
    }

    pub fn new(config: RunnerConfig, store: Arc<dyn QueueStore>, judge: Arc<dyn Judge>) -> Self {
        let queue = QueueClient::new(store, &config);
        Self {
            config: Arc::new(config),
            queue,
            judge,
        }
    }

    /// Run the node until `shutdown` fires.
    ///
    /// Starts the heartbeat and the cache sweeper as independent tasks, then
    /// runs the job loop in place. The heartbeat gets its own store
    /// connection, since the job loop parks in blocking pops on the shared
    /// one.
    ///
    /// # Errors
    ///
    /// Only if the heartbeat connection cannot be opened. Everything after
    /// startup logs and retries instead of failing.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let heartbeat_queue = self.queue.dedicated().await?;
        let heartbeat = HeartbeatSender::new(heartbeat_queue, self.config.heartbeat_interval());
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_task = tokio::spawn(async move { heartbeat.run(heartbeat_shutdown).await });

        let sweeper = CacheSweeper::new(
            self.config.cache_dir.clone(),
            self.config.cache_max_age(),
            self.config.cache_sweep_interval(),
        );
        let sweeper_shutdown = shutdown.clone();
        let sweeper_task = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

        tracing::info!(
            runner_id = self.config.id,
            group = %self.config.group,
            relative_slowness = self.config.relative_slowness,
            "Node started"
        );
        let runner = JobRunner::new(self.queue, self.judge);
        runner.run(shutdown.clone()).await;

        // The runner only returns on shutdown; make sure the rest follows.
        shutdown.cancel();
        for (name, task) in [("heartbeat", heartbeat_task), ("sweeper", sweeper_task)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Background task failed");
            }
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
