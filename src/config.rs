use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RunnerError};
use crate::task::ResourceUsage;

/// Identity of this runner; namespaces every queue channel it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerIdentity {
    pub runner_id: u64,
    pub runner_group: String,
}

/// Connection parameters for the shared queue store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Redis connection URL, e.g. `redis://:password@host:6379/0`.
    pub url: String,
    /// Prefix prepended to every key so several deployments can share a store.
    pub prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "judge".to_string(),
        }
    }
}

/// Compilers, interpreters and checkers used by the stage pipeline.
///
/// Paths left unset are looked up on `PATH` when the pipeline is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub cxx: Option<PathBuf>,
    pub cxxflags: Vec<String>,
    pub git: Option<PathBuf>,
    pub gitflags: Vec<String>,
    pub make: Option<PathBuf>,
    pub cmake: Option<PathBuf>,
    pub iverilog: Option<PathBuf>,
    pub vvp: Option<PathBuf>,
    pub valgrind: Option<PathBuf>,
    pub valgrind_args: Vec<String>,
    /// Exit code valgrind uses to report memory errors.
    pub valgrind_exit_code: i32,
    pub diff: Option<PathBuf>,
    /// Envelope for every build step.
    pub compile_limits: ResourceUsage,
    /// Envelope for every checker invocation.
    pub checker_limits: ResourceUsage,
}

pub const VALGRIND_EXIT_CODE: i32 = 250;

const QUEUE_RESPONSE_MARGIN: Duration = Duration::from_secs(5);

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cxx: None,
            cxxflags: ["-fmax-errors=10", "-O2", "-DONLINE_JUDGE", "-std=c++17"]
                .map(String::from)
                .to_vec(),
            git: None,
            gitflags: ["--depth", "1", "--recurse-submodules", "--no-local"]
                .map(String::from)
                .to_vec(),
            make: None,
            cmake: None,
            iverilog: None,
            vvp: None,
            valgrind: None,
            valgrind_args: vec![
                "--tool=memcheck".to_string(),
                "--leak-check=full".to_string(),
                "--exit-on-first-error=yes".to_string(),
                format!("--error-exitcode={VALGRIND_EXIT_CODE}"),
                "--quiet".to_string(),
            ],
            valgrind_exit_code: VALGRIND_EXIT_CODE,
            diff: None,
            compile_limits: ResourceUsage {
                time_msecs: 30_000,
                memory_bytes: 2 * 1024 * 1024 * 1024,
                file_count: -1,
                file_size_bytes: 256 * 1024 * 1024,
            },
            checker_limits: ResourceUsage::new(10_000, 1024 * 1024 * 1024),
        }
    }
}

/// Immutable runner configuration, built once at startup and shared by every
/// component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub id: u64,
    pub group: String,
    /// How much slower this group's hardware is than the reference machine.
    pub relative_slowness: f64,
    pub working_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    /// Unprivileged uid (and gid) for submitted programs when running as root.
    pub worker_uid: Option<u32>,
    pub queue: QueueConfig,
    pub heartbeat_interval_ms: u64,
    pub poll_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    /// Ceiling on a job's lifetime; bounds progress channel expiry.
    pub task_timeout_secs: u64,
    pub cache_max_age_secs: u64,
    pub cache_sweep_interval_secs: u64,
    /// Environment of every child process, as `KEY=VALUE`.
    pub task_env: Vec<String>,
    pub toolchain: ToolchainConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            id: 1,
            group: "default".to_string(),
            relative_slowness: 1.0,
            working_dir: PathBuf::from("/var/lib/judge-runner/work"),
            cache_dir: PathBuf::from("/var/lib/judge-runner/cache"),
            log_dir: None,
            worker_uid: None,
            queue: QueueConfig::default(),
            heartbeat_interval_ms: 2000,
            poll_timeout_secs: 10,
            retry_backoff_ms: 2000,
            task_timeout_secs: 3600,
            cache_max_age_secs: 86_400,
            cache_sweep_interval_secs: 86_400,
            task_env: [
                "PATH=/usr/local/bin:/usr/bin:/bin",
                "CI=true",
                "CI_ENV=testing",
                "ONLINE_JUDGE=true",
                "ACMOJ=true",
            ]
            .map(String::from)
            .to_vec(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn new(id: u64, group: impl Into<String>) -> Self {
        Self {
            id,
            group: group.into(),
            ..Default::default()
        }
    }

    /// Load a YAML configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: RunnerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_dirs(mut self, working_dir: PathBuf, cache_dir: PathBuf) -> Self {
        self.working_dir = working_dir;
        self.cache_dir = cache_dir;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(RunnerError::Config("group must not be empty".into()));
        }
        if !(self.relative_slowness.is_finite() && self.relative_slowness > 0.0) {
            return Err(RunnerError::Config(format!(
                "relative_slowness must be positive, got {}",
                self.relative_slowness
            )));
        }
        if self.poll_timeout_secs == 0 {
            // A zero timeout means "block forever" to the queue store.
            return Err(RunnerError::Config(
                "poll_timeout_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.cache_sweep_interval_secs == 0 {
            return Err(RunnerError::Config("intervals must be non-zero".into()));
        }
        if let Some(bad) = self.task_env.iter().find(|kv| !kv.contains('=')) {
            return Err(RunnerError::Config(format!(
                "task_env entry {bad:?} is not KEY=VALUE"
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> RunnerIdentity {
        RunnerIdentity {
            runner_id: self.id,
            runner_group: self.group.clone(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Deadline on any single queue store reply. Blocking pops wait up to
    /// the poll timeout server-side, so this stays a margin above it.
    pub fn queue_response_timeout(&self) -> Duration {
        self.poll_timeout() + QUEUE_RESPONSE_MARGIN
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// `task_env` split into key/value pairs.
    pub fn task_env_pairs(&self) -> Vec<(String, String)> {
        self.task_env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
