use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::ToolchainConfig;
use crate::error::{cache_io, Result, RunnerError};
use crate::task::{JudgeStatus, Lane, ResourceUsage};
use crate::worker::executor::{Executor, Invocation};

/// Diagnostics longer than this are cut before they go into a verdict.
pub const DIAGNOSTICS_LIMIT: usize = 4096;

/// Name of the executable every lane produces.
pub const ARTIFACT_NAME: &str = "code";

/// Outcome of the compile stage.
#[derive(Debug)]
pub enum BuildOutcome {
    Built(Artifact),
    /// Candidate fault, with truncated diagnostics.
    Failed(String),
}

/// A runnable build product.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    /// Interpreter the artifact is handed to, e.g. `vvp` for Verilog.
    pub interpreter: Option<PathBuf>,
}

/// Resolved tool paths plus the flags and envelopes they run with.
#[derive(Debug, Clone)]
pub struct Toolchain {
    cxx: Option<PathBuf>,
    git: Option<PathBuf>,
    make: Option<PathBuf>,
    cmake: Option<PathBuf>,
    iverilog: Option<PathBuf>,
    vvp: Option<PathBuf>,
    valgrind: Option<PathBuf>,
    diff: Option<PathBuf>,
    config: ToolchainConfig,
}

fn resolve(configured: &Option<PathBuf>, name: &str) -> Option<PathBuf> {
    match configured {
        Some(path) => Some(path.clone()),
        None => match which::which(name) {
            Ok(path) => Some(path),
            Err(_) => {
                tracing::debug!(tool = name, "Tool not found on PATH");
                None
            }
        },
    }
}

impl Toolchain {
    /// Fill in every tool the configuration leaves unset from `PATH`.
    /// Missing tools only fail the jobs that need them.
    pub fn resolve(config: &ToolchainConfig) -> Self {
        Self {
            cxx: resolve(&config.cxx, "g++"),
            git: resolve(&config.git, "git"),
            make: resolve(&config.make, "make"),
            cmake: resolve(&config.cmake, "cmake"),
            iverilog: resolve(&config.iverilog, "iverilog"),
            vvp: resolve(&config.vvp, "vvp"),
            valgrind: resolve(&config.valgrind, "valgrind"),
            diff: resolve(&config.diff, "diff"),
            config: config.clone(),
        }
    }

    pub fn compile_limits(&self) -> ResourceUsage {
        self.config.compile_limits
    }

    pub fn checker_limits(&self) -> ResourceUsage {
        self.config.checker_limits
    }

    pub fn valgrind_exit_code(&self) -> i32 {
        self.config.valgrind_exit_code
    }

    pub fn diff(&self) -> Result<&Path> {
        require(&self.diff, "diff")
    }

    /// Build `lane` inside `dir`. `source` is the fetched source file for
    /// lanes that have one.
    pub async fn build(
        &self,
        lane: &Lane,
        source: Option<&Path>,
        dir: &Path,
        executor: &Executor,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let steps = BuildSteps {
            dir,
            limits: self.compile_limits(),
            executor,
            cancel,
        };
        match lane {
            Lane::Cpp { .. } => {
                let cxx = require(&self.cxx, "g++")?;
                let main = place_source(source, dir, "main.cpp").await?;
                let compile = Invocation::new(cxx, dir)
                    .args(self.config.cxxflags.iter().cloned())
                    .args(["-o", ARTIFACT_NAME])
                    .arg(main);
                if let Some(diag) = steps.run("compile", compile).await? {
                    return Ok(BuildOutcome::Failed(diag));
                }
                Ok(BuildOutcome::Built(Artifact {
                    path: dir.join(ARTIFACT_NAME),
                    interpreter: None,
                }))
            }
            Lane::Git { repository } => self.build_git(repository, &steps).await,
            Lane::Verilog { .. } => {
                let iverilog = require(&self.iverilog, "iverilog")?;
                let vvp = require(&self.vvp, "vvp")?;
                let main = place_source(source, dir, "main.v").await?;
                let compile = Invocation::new(iverilog, dir)
                    .args(["-o", ARTIFACT_NAME])
                    .arg(main);
                if let Some(diag) = steps.run("compile", compile).await? {
                    return Ok(BuildOutcome::Failed(diag));
                }
                Ok(BuildOutcome::Built(Artifact {
                    path: dir.join(ARTIFACT_NAME),
                    interpreter: Some(vvp.to_path_buf()),
                }))
            }
        }
    }

    async fn build_git(&self, repository: &str, steps: &BuildSteps<'_>) -> Result<BuildOutcome> {
        let git = require(&self.git, "git")?;
        let checkout = steps.dir.join("src");

        let clone = Invocation::new(git, steps.dir)
            .arg("clone")
            .args(self.config.gitflags.iter().cloned())
            .arg(repository)
            .arg(checkout.to_string_lossy());
        if let Some(diag) = steps.run("clone", clone).await? {
            return Ok(BuildOutcome::Failed(diag));
        }

        let artifact = if checkout.join("Makefile").is_file() {
            let make = require(&self.make, "make")?;
            if let Some(diag) = steps.run("make", Invocation::new(make, &checkout)).await? {
                return Ok(BuildOutcome::Failed(diag));
            }
            checkout.join(ARTIFACT_NAME)
        } else if checkout.join("CMakeLists.txt").is_file() {
            let cmake = require(&self.cmake, "cmake")?;
            let configure = Invocation::new(cmake, &checkout).args(["-S", ".", "-B", "bin"]);
            if let Some(diag) = steps.run("cmake", configure).await? {
                return Ok(BuildOutcome::Failed(diag));
            }
            let build = Invocation::new(cmake, &checkout).args(["--build", "bin"]);
            if let Some(diag) = steps.run("cmake-build", build).await? {
                return Ok(BuildOutcome::Failed(diag));
            }
            checkout.join("bin").join(ARTIFACT_NAME)
        } else {
            return Ok(BuildOutcome::Failed(
                "repository has neither a Makefile nor a CMakeLists.txt".to_string(),
            ));
        };

        if !artifact.is_file() {
            return Ok(BuildOutcome::Failed(format!(
                "build finished but produced no executable named {ARTIFACT_NAME:?}"
            )));
        }
        Ok(BuildOutcome::Built(Artifact {
            path: artifact,
            interpreter: None,
        }))
    }

    /// Command line that runs `artifact`, optionally under valgrind.
    pub fn run_invocation(
        &self,
        artifact: &Artifact,
        working_dir: &Path,
        memcheck: bool,
    ) -> Result<Invocation> {
        let mut argv: Vec<String> = Vec::new();
        let program = match &artifact.interpreter {
            Some(interpreter) => {
                argv.push(artifact.path.to_string_lossy().into_owned());
                interpreter.clone()
            }
            None => artifact.path.clone(),
        };

        if !memcheck {
            return Ok(Invocation::new(program, working_dir)
                .args(argv)
                .limit_address_space(true));
        }
        let valgrind = require(&self.valgrind, "valgrind")?;
        Ok(Invocation::new(valgrind, working_dir)
            .args(self.config.valgrind_args.iter().cloned())
            .arg(program.to_string_lossy())
            .args(argv))
    }
}

fn require<'a>(tool: &'a Option<PathBuf>, name: &'static str) -> Result<&'a Path> {
    tool.as_deref().ok_or(RunnerError::ToolchainMissing(name))
}

async fn place_source(source: Option<&Path>, dir: &Path, name: &str) -> Result<String> {
    let source = source.ok_or_else(|| RunnerError::Internal("lane needs a source file".into()))?;
    tokio::fs::copy(source, dir.join(name))
        .await
        .map_err(cache_io(source))?;
    Ok(name.to_string())
}

struct BuildSteps<'a> {
    dir: &'a Path,
    limits: ResourceUsage,
    executor: &'a Executor,
    cancel: &'a CancellationToken,
}

impl BuildSteps<'_> {
    /// Run one build step; `Some(diagnostics)` when it failed.
    async fn run(&self, name: &str, invocation: Invocation) -> Result<Option<String>> {
        let stdout = self.dir.join(format!("{name}.stdout"));
        let stderr = self.dir.join(format!("{name}.stderr"));
        let invocation = invocation
            .limits(self.limits)
            .stdout(&stdout)
            .stderr(&stderr);
        let result = self.executor.execute(&invocation, self.cancel).await?;
        let Some(status) = result.verdict(&self.limits, None) else {
            return Ok(None);
        };

        tracing::debug!(step = name, %status, termination = %result.termination, "Build step failed");
        let mut diagnostics = String::new();
        for path in [&stderr, &stdout] {
            if let Ok(bytes) = tokio::fs::read(path).await {
                diagnostics.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        let reason = match status {
            JudgeStatus::TimeLimitExceeded => format!("{name}: time limit exceeded\n"),
            JudgeStatus::MemoryLimitExceeded => format!("{name}: memory limit exceeded\n"),
            JudgeStatus::DiskLimitExceeded => format!("{name}: output limit exceeded\n"),
            _ => format!("{name}: {}\n", result.termination),
        };
        Ok(Some(truncate_diagnostics(reason + &diagnostics)))
    }
}

/// Cut `text` to [`DIAGNOSTICS_LIMIT`] bytes on a char boundary.
pub fn truncate_diagnostics(mut text: String) -> String {
    if text.len() <= DIAGNOSTICS_LIMIT {
        return text;
    }
    let mut cut = DIAGNOSTICS_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[truncated]");
    text
}
