use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{format_error_chain, Result};
use crate::queue::QueueClient;
use crate::task::{Job, JudgeStatus, StatusUpdate};
use crate::worker::pipeline::Judge;

/// How long a cancelled judge gets to tear down before its task is dropped.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Judged; `Done` was reported with this status.
    Done(JudgeStatus),
    /// Cancelled by an abort request or shutdown; nothing further reported.
    Aborted,
    /// `Error` was reported with this message.
    Failed(String),
    /// `Started` could not be reported, so nothing was.
    Abandoned,
}

/// Claims jobs one at a time and drives each through the judge, racing it
/// against the job's abort channel.
pub struct JobRunner {
    queue: QueueClient,
    judge: Arc<dyn Judge>,
}

impl JobRunner {
    pub fn new(queue: QueueClient, judge: Arc<dyn Judge>) -> Self {
        Self { queue, judge }
    }

    /// Process jobs until `shutdown` fires. A job in flight at that moment is
    /// aborted silently.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(e) = self.queue.reset_in_progress().await {
            tracing::warn!(error = %e, "Failed to reset in-progress marker");
        }
        tracing::info!(
            runner_id = self.queue.names().identity().runner_id,
            group = %self.queue.names().identity().runner_group,
            "Runner waiting for jobs"
        );

        loop {
            let (job_id, job) = tokio::select! {
                next = self.queue.dequeue_next() => next,
                _ = shutdown.cancelled() => break,
            };
            let outcome = self.process(&job_id, job, &shutdown).await;
            tracing::info!(job_id = %job_id, outcome = ?outcome, "Job finished");
            if shutdown.is_cancelled() {
                break;
            }
        }
        tracing::info!("Runner stopped");
    }

    /// Report `Started`, judge, report the outcome, clear the marker.
    pub async fn process(
        &self,
        job_id: &str,
        job: Result<Job>,
        shutdown: &CancellationToken,
    ) -> JobOutcome {
        let span = tracing::info_span!(
            "job",
            job_id = %job_id,
            runner_id = self.queue.names().identity().runner_id
        );
        async {
            if let Err(e) = self.queue.push_progress(job_id, &StatusUpdate::Started).await {
                tracing::error!(error = %e, "Failed to report start, abandoning job");
                self.queue.complete(job_id).await;
                return JobOutcome::Abandoned;
            }

            let outcome = match job {
                Ok(job) => self.execute(job_id, job, shutdown).await,
                Err(e) => {
                    let message = format_error_chain(&e);
                    tracing::warn!(error = %message, "Unreadable job payload");
                    self.report(job_id, StatusUpdate::Error { message: message.clone() })
                        .await;
                    JobOutcome::Failed(message)
                }
            };
            self.queue.complete(job_id).await;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job_id: &str, job: Job, shutdown: &CancellationToken) -> JobOutcome {
        tracing::info!(submission_id = %job.submission_id, lane = job.lane.name(), "Judging job");
        let cancel = shutdown.child_token();
        let listener = match self.queue.dedicated().await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "No dedicated connection for abort listener, sharing");
                self.queue.clone()
            }
        };

        let mut handle = {
            let judge = self.judge.clone();
            let job_id = job_id.to_string();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { judge.judge(&job_id, &job, cancel).await }
                    .instrument(tracing::Span::current()),
            )
        };

        let finished = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = listener.listen_abort(job_id) => None,
            _ = shutdown.cancelled() => None,
        };

        let Some(joined) = finished else {
            cancel.cancel();
            if tokio::time::timeout(TEARDOWN_GRACE, &mut handle).await.is_err() {
                tracing::warn!("Judge ignored cancellation, dropping it");
                handle.abort();
            }
            return JobOutcome::Aborted;
        };

        match joined {
            Ok(Ok(result)) => {
                let status = result.status;
                tracing::info!(%status, score = result.score, "Judged");
                self.report(job_id, StatusUpdate::Done { result }).await;
                JobOutcome::Done(status)
            }
            Ok(Err(e)) if e.is_cancelled() => JobOutcome::Aborted,
            Ok(Err(e)) => {
                let message = format_error_chain(&e);
                tracing::error!(error = %message, "Judge failed");
                self.report(job_id, StatusUpdate::Error { message: message.clone() })
                    .await;
                JobOutcome::Failed(message)
            }
            Err(e) => {
                let message = format!("judge task failed: {e}");
                tracing::error!(error = %message, "Judge panicked");
                self.report(job_id, StatusUpdate::Error { message: message.clone() })
                    .await;
                JobOutcome::Failed(message)
            }
        }
    }

    async fn report(&self, job_id: &str, update: StatusUpdate) {
        if let Err(e) = self.queue.push_progress(job_id, &update).await {
            tracing::error!(error = %e, "Failed to report job outcome");
        }
    }
}
