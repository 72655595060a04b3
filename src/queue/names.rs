use crate::config::RunnerIdentity;

/// Key names of one runner's queue channels.
///
/// Everything is namespaced by prefix and runner group, so several groups can
/// share one queue store; runner-owned keys additionally carry the runner id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    prefix: String,
    identity: RunnerIdentity,
}

/// Per-job channel names, derived from the job id; nothing is stored for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobChannels {
    pub payload: String,
    pub in_progress: String,
    pub progress: String,
    pub abort: String,
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>, identity: RunnerIdentity) -> Self {
        Self {
            prefix: prefix.into(),
            identity,
        }
    }

    pub fn identity(&self) -> &RunnerIdentity {
        &self.identity
    }

    fn group_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identity.runner_group)
    }

    fn runner_key(&self) -> String {
        format!("{}:runner:{}", self.group_key(), self.identity.runner_id)
    }

    /// FIFO of job ids shared by every runner of the group.
    pub fn pending(&self) -> String {
        format!("{}:pending", self.group_key())
    }

    /// Job ids this runner has claimed but not finished.
    pub fn in_progress(&self) -> String {
        format!("{}:in-progress", self.runner_key())
    }

    pub fn heartbeat(&self) -> String {
        format!("{}:heartbeat", self.runner_key())
    }

    pub fn job(&self, job_id: &str) -> JobChannels {
        let task = format!("{}:task:{}", self.group_key(), job_id);
        JobChannels {
            payload: format!("{task}:payload"),
            in_progress: self.in_progress(),
            progress: format!("{task}:progress"),
            abort: format!("{task}:abort"),
        }
    }
}
