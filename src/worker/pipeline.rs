use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cache::ArtifactCache;
use crate::config::RunnerConfig;
use crate::error::{cache_io, format_error_chain, Result, RunnerError};
use crate::task::{CheckerSpec, Job, JudgeResult, JudgeStatus, ResourceUsage, TestCase, TestpointResult};
use crate::worker::checker::{CheckOutcome, Checker, Comparison};
use crate::worker::executor::Executor;
use crate::worker::toolchain::{Artifact, BuildOutcome, Toolchain};

/// Turns a job into a verdict.
///
/// Candidate faults and infrastructure faults both come back as `Ok` with the
/// matching status; `Err` is left for cancellation and for failures nobody
/// anticipated.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, job_id: &str, job: &Job, cancel: CancellationToken) -> Result<JudgeResult>;
}

/// Fetch → Compile → Run → Compare, in a scratch directory per job.
pub struct Pipeline {
    cache: ArtifactCache,
    toolchain: Toolchain,
    executor: Executor,
    working_dir: PathBuf,
}

/// Test data of one case, resolved to local files.
struct FetchedCase {
    input: Option<PathBuf>,
    answer: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(config: &RunnerConfig) -> Result<Self> {
        Ok(Self::with_parts(
            ArtifactCache::new(&config.cache_dir)?,
            Toolchain::resolve(&config.toolchain),
            Executor::new(config),
            config.working_dir.clone(),
        ))
    }

    pub fn with_parts(
        cache: ArtifactCache,
        toolchain: Toolchain,
        executor: Executor,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            cache,
            toolchain,
            executor,
            working_dir,
        }
    }

    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        tokio::select! {
            cached = self.cache.ensure_cached(url) => Ok(cached?.path),
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        }
    }

    /// Directory the candidate's processes write into; world-writable when
    /// they run as another user.
    async fn scratch_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        if self.executor.drops_privileges() {
            tokio::fs::set_permissions(path, Permissions::from_mode(0o777)).await?;
        }
        Ok(())
    }

    async fn stages(&self, job: &Job, workdir: &Path, cancel: &CancellationToken) -> Result<JudgeResult> {
        // Fetch
        let source = match job.lane.source_locator() {
            Some(url) => Some(self.fetch(url, cancel).await?),
            None => None,
        };
        let mut cases = Vec::with_capacity(job.testcases.len());
        for testcase in &job.testcases {
            let input = match &testcase.input {
                Some(url) => Some(self.fetch(url, cancel).await?),
                None => None,
            };
            let answer = match &testcase.answer {
                Some(url) => Some(self.fetch(url, cancel).await?),
                None => None,
            };
            cases.push(FetchedCase { input, answer });
        }
        let checker = match &job.checker {
            CheckerSpec::Diff => Checker::Diff(self.toolchain.diff()?.to_path_buf()),
            CheckerSpec::Custom { executable } => {
                let fetched = self.fetch(executable, cancel).await?;
                let local = workdir.join("checker");
                tokio::fs::copy(&fetched, &local)
                    .await
                    .map_err(cache_io(&fetched))?;
                tokio::fs::set_permissions(&local, Permissions::from_mode(0o755))
                    .await
                    .map_err(cache_io(&local))?;
                Checker::Custom(local)
            }
        };
        tracing::debug!(cases = cases.len(), "Artifacts ready");

        // Compile
        let build_dir = workdir.join("build");
        self.scratch_dir(&build_dir).await?;
        let artifact = match self
            .toolchain
            .build(&job.lane, source.as_deref(), &build_dir, &self.executor, cancel)
            .await?
        {
            BuildOutcome::Built(artifact) => artifact,
            BuildOutcome::Failed(diagnostics) => {
                tracing::info!(lane = job.lane.name(), "Compile error");
                return Ok(JudgeResult::compile_error(diagnostics));
            }
        };
        if let Some(url) = &job.artifact_upload {
            self.cache.upload(&artifact.path, url).await?;
        }

        // Run + Compare
        let out_dir = workdir.join("out");
        tokio::fs::create_dir_all(&out_dir).await?;
        let mut testpoints = Vec::with_capacity(job.testcases.len());
        let mut peak = ResourceUsage::unbounded();
        let mut remaining = job.testcases.iter().zip(&cases).enumerate();

        for (index, (testcase, fetched)) in remaining.by_ref() {
            let point = self
                .run_case(job, index, testcase, fetched, &artifact, &checker, workdir, &out_dir, cancel)
                .await?;
            if let Some(usage) = &point.resource_usage {
                peak = peak.peak(usage);
            }
            let status = point.status;
            tracing::debug!(testcase = %testcase.id, %status, "Test case finished");
            testpoints.push(point);
            if !job.policy.continues_after(status) {
                break;
            }
        }
        testpoints.extend(remaining.map(|(_, (testcase, _))| TestpointResult::skipped(&testcase.id)));

        let (status, score) = job.policy.aggregate(&testpoints);
        let message = testpoints
            .iter()
            .find(|t| t.status == status && !status.is_accepted())
            .map(|t| match &t.message {
                Some(message) => format!("test case {}: {}", t.id, message),
                None => format!("test case {}: {}", t.id, t.status),
            });
        Ok(JudgeResult {
            status,
            score,
            message,
            resource_usage: peak,
            testpoints,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_case(
        &self,
        job: &Job,
        index: usize,
        testcase: &TestCase,
        fetched: &FetchedCase,
        artifact: &Artifact,
        checker: &Checker,
        workdir: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<TestpointResult> {
        let run_dir = workdir.join("run").join(index.to_string());
        self.scratch_dir(&run_dir).await?;
        let output = out_dir.join(format!("{index}.out"));

        let mut limits = job.limits_for(testcase);
        if job.memcheck {
            // valgrind's own footprint would swamp the program's.
            limits.memory_bytes = crate::task::resource::UNBOUNDED;
        }
        let mut invocation = self
            .toolchain
            .run_invocation(artifact, &run_dir, job.memcheck)?
            .limits(limits)
            .stdout(&output)
            .stderr(out_dir.join(format!("{index}.err")))
            .watch_output(&run_dir);
        if let Some(input) = &fetched.input {
            invocation = invocation.stdin(input);
        }

        let result = self.executor.execute(&invocation, cancel).await?;
        let leak_code = job.memcheck.then(|| self.toolchain.valgrind_exit_code());
        let (status, message) = match result.verdict(&limits, leak_code) {
            Some(status) => (status, None),
            None => match &fetched.answer {
                Some(answer) => {
                    let compare = Comparison {
                        input: fetched.input.as_deref(),
                        output: &output,
                        answer,
                    };
                    let compare_dir = workdir.join("check").join(index.to_string());
                    tokio::fs::create_dir_all(&compare_dir).await?;
                    match checker
                        .check(
                            compare,
                            &compare_dir,
                            self.toolchain.checker_limits(),
                            &self.executor,
                            cancel,
                        )
                        .await?
                    {
                        CheckOutcome::Accepted => (JudgeStatus::Accepted, None),
                        CheckOutcome::WrongAnswer(message) => (JudgeStatus::WrongAnswer, message),
                    }
                }
                None => (JudgeStatus::Accepted, None),
            },
        };

        Ok(TestpointResult {
            id: testcase.id.clone(),
            status,
            score: if status.is_accepted() { testcase.score } else { 0.0 },
            message,
            resource_usage: Some(result.usage),
        })
    }
}

/// Keep job ids usable as part of a directory name.
fn dir_prefix(job_id: &str) -> String {
    let safe: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    format!("job-{safe}-")
}

#[async_trait]
impl Judge for Pipeline {
    async fn judge(&self, job_id: &str, job: &Job, cancel: CancellationToken) -> Result<JudgeResult> {
        tokio::fs::create_dir_all(&self.working_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix(&dir_prefix(job_id))
            .tempdir_in(&self.working_dir)?;
        if self.executor.drops_privileges() {
            tokio::fs::set_permissions(workdir.path(), Permissions::from_mode(0o755)).await?;
        }
        tracing::debug!(workdir = %workdir.path().display(), "Judging");

        match self.stages(job, workdir.path(), &cancel).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_infrastructure() => {
                let message = format_error_chain(&e);
                tracing::warn!(error = %message, "Infrastructure fault while judging");
                Ok(JudgeResult::system_error(message))
            }
            Err(e) => Err(e),
        }
    }
}
