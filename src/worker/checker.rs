use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, RunnerError};
use crate::task::{JudgeStatus, ResourceUsage};
use crate::worker::executor::{Executor, Invocation, Termination};
use crate::worker::toolchain::truncate_diagnostics;

const NO_INPUT: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Accepted,
    /// Mismatch, with whatever the checker printed about it.
    WrongAnswer(Option<String>),
}

/// Files of one test case handed to a checker.
#[derive(Debug, Clone, Copy)]
pub struct Comparison<'a> {
    pub input: Option<&'a Path>,
    pub output: &'a Path,
    pub answer: &'a Path,
}

/// Decides whether a program's output matches the expected answer.
///
/// Anything other than a clean accept/reject (crash, timeout, unknown exit
/// code) is a [`RunnerError::Checker`] fault, not a verdict on the program.
#[derive(Debug, Clone)]
pub enum Checker {
    /// `diff --brief --strip-trailing-cr --ignore-trailing-space`: exit 0
    /// same, 1 different.
    Diff(PathBuf),
    /// `checker <input> <output> <answer>`: exit 0 accept, 1 reject.
    Custom(PathBuf),
}

impl Checker {
    pub async fn check(
        &self,
        files: Comparison<'_>,
        dir: &Path,
        limits: ResourceUsage,
        executor: &Executor,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome> {
        let report = dir.join("checker.stdout");
        let invocation = match self {
            Checker::Diff(diff) => Invocation::new(diff, dir).args([
                "--brief",
                "--strip-trailing-cr",
                "--ignore-trailing-space",
            ]),
            Checker::Custom(checker) => Invocation::new(checker, dir)
                .arg(files.input.unwrap_or(Path::new(NO_INPUT)).to_string_lossy()),
        }
        .arg(files.output.to_string_lossy())
        .arg(files.answer.to_string_lossy())
        .limits(limits)
        .stdout(&report)
        .stderr(dir.join("checker.stderr"));

        let result = executor.execute(&invocation, cancel).await?;
        if let Some(
            status @ (JudgeStatus::TimeLimitExceeded
            | JudgeStatus::MemoryLimitExceeded
            | JudgeStatus::DiskLimitExceeded),
        ) = result.verdict(&limits, None)
        {
            return Err(RunnerError::Checker(format!("checker hit {status}")));
        }

        match result.termination {
            Termination::Exited(0) => Ok(CheckOutcome::Accepted),
            Termination::Exited(1) => {
                let message = match self {
                    Checker::Diff(_) => None,
                    Checker::Custom(_) => tokio::fs::read(&report)
                        .await
                        .ok()
                        .map(|b| truncate_diagnostics(String::from_utf8_lossy(&b).trim().to_string()))
                        .filter(|m| !m.is_empty()),
                };
                Ok(CheckOutcome::WrongAnswer(message))
            }
            other => Err(RunnerError::Checker(format!("checker ended with {other}"))),
        }
    }
}
