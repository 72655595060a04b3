use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Queue store error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid locator {url}: {reason}")]
    InvalidLocator { url: String, reason: String },

    #[error("Unexpected response status {status} for {method} {url}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("Artifact cache I/O failed at {}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Toolchain component not available: {0}")]
    ToolchainMissing(&'static str),

    #[error("Checker failed: {0}")]
    Checker(String),

    #[error("Payload for job {0} is missing")]
    PayloadMissing(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// True when the error is the result of cooperative cancellation rather
    /// than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Cancelled)
    }

    /// Failures of the judge's own infrastructure while handling a job.
    /// They end the job with a `system_error` verdict instead of an error
    /// report.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            RunnerError::Http(_)
                | RunnerError::InvalidLocator { .. }
                | RunnerError::UnexpectedStatus { .. }
                | RunnerError::Cache { .. }
                | RunnerError::Spawn { .. }
                | RunnerError::ToolchainMissing(_)
                | RunnerError::Checker(_)
        )
    }
}

/// Wrap an I/O failure on a cache file so it is reported as an
/// infrastructure fault rather than a plain I/O error.
pub fn cache_io(path: &Path) -> impl FnOnce(std::io::Error) -> RunnerError {
    let path = path.to_path_buf();
    move |source| RunnerError::Cache { path, source }
}

impl From<serde_yaml::Error> for RunnerError {
    fn from(e: serde_yaml::Error) -> Self {
        RunnerError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Render an error together with its `source()` chain, one cause per line.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_distinguished() {
        assert!(RunnerError::Cancelled.is_cancelled());
        assert!(!RunnerError::Internal("boom".into()).is_cancelled());
    }

    #[test]
    fn infrastructure_faults_are_classified() {
        assert!(RunnerError::ToolchainMissing("g++").is_infrastructure());
        assert!(RunnerError::Checker("exit code 3".into()).is_infrastructure());
        assert!(RunnerError::UnexpectedStatus {
            method: "GET",
            url: "http://x".into(),
            status: 404
        }
        .is_infrastructure());
        let enotdir = std::io::Error::from_raw_os_error(libc::ENOTDIR);
        assert!(cache_io(Path::new("/var/cache/judge/x"))(enotdir).is_infrastructure());
        assert!(!RunnerError::Io(std::io::ErrorKind::Other.into()).is_infrastructure());
        assert!(!RunnerError::Cancelled.is_infrastructure());
        assert!(!RunnerError::Internal("bug".into()).is_infrastructure());
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = RunnerError::Spawn {
            program: PathBuf::from("/usr/bin/g++"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let rendered = format_error_chain(&err);
        assert!(rendered.starts_with("Failed to spawn /usr/bin/g++"));
        assert!(rendered.contains("caused by: no such file"));
    }

    #[test]
    fn yaml_errors_become_config_errors() {
        let err: RunnerError = serde_yaml::from_str::<u64>("not: [a number")
            .unwrap_err()
            .into();
        assert!(matches!(err, RunnerError::Config(_)));
    }
}
