use serde::{Deserialize, Serialize};

use crate::task::resource::ResourceUsage;

/// Verdict / lifecycle state of a judged submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStatus {
    Pending,
    Compiling,
    Judging,
    Void,
    Aborted,

    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    DiskLimitExceeded,
    MemoryLeak,

    WrongAnswer,
    Skipped,
    SystemError,
    UnknownError,

    Accepted,
}

impl JudgeStatus {
    /// `pending`, `compiling` and `judging` are the only non-terminal states.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JudgeStatus::Pending | JudgeStatus::Compiling | JudgeStatus::Judging
        )
    }

    /// Verdicts caused by the submitted code rather than by the judge.
    pub fn is_candidate_fault(&self) -> bool {
        matches!(
            self,
            JudgeStatus::CompileError
                | JudgeStatus::RuntimeError
                | JudgeStatus::TimeLimitExceeded
                | JudgeStatus::MemoryLimitExceeded
                | JudgeStatus::DiskLimitExceeded
                | JudgeStatus::MemoryLeak
                | JudgeStatus::WrongAnswer
        )
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, JudgeStatus::Accepted)
    }
}

impl std::fmt::Display for JudgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JudgeStatus::Pending => "pending",
            JudgeStatus::Compiling => "compiling",
            JudgeStatus::Judging => "judging",
            JudgeStatus::Void => "void",
            JudgeStatus::Aborted => "aborted",
            JudgeStatus::CompileError => "compile_error",
            JudgeStatus::RuntimeError => "runtime_error",
            JudgeStatus::TimeLimitExceeded => "time_limit_exceeded",
            JudgeStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            JudgeStatus::DiskLimitExceeded => "disk_limit_exceeded",
            JudgeStatus::MemoryLeak => "memory_leak",
            JudgeStatus::WrongAnswer => "wrong_answer",
            JudgeStatus::Skipped => "skipped",
            JudgeStatus::SystemError => "system_error",
            JudgeStatus::UnknownError => "unknown_error",
            JudgeStatus::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestpointResult {
    pub id: String,
    pub status: JudgeStatus,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl TestpointResult {
    pub fn skipped(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JudgeStatus::Skipped,
            score: 0.0,
            message: None,
            resource_usage: None,
        }
    }
}

/// Final result of a judged job, carried by [`StatusUpdate::Done`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub status: JudgeStatus,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub testpoints: Vec<TestpointResult>,
}

impl JudgeResult {
    /// A result without any test case outcomes, e.g. a compile error.
    pub fn verdict(status: JudgeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            score: 0.0,
            message: Some(message.into()),
            resource_usage: ResourceUsage::unbounded(),
            testpoints: Vec::new(),
        }
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::verdict(JudgeStatus::SystemError, message)
    }

    pub fn compile_error(diagnostics: impl Into<String>) -> Self {
        Self::verdict(JudgeStatus::CompileError, diagnostics)
    }
}

/// The only values ever pushed to a job's progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    Started,
    Done { result: JudgeResult },
    Error { message: String },
}

impl StatusUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusUpdate::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pipeline_progress_states_are_non_terminal() {
        assert!(!JudgeStatus::Pending.is_terminal());
        assert!(!JudgeStatus::Compiling.is_terminal());
        assert!(!JudgeStatus::Judging.is_terminal());
        assert!(JudgeStatus::Accepted.is_terminal());
        assert!(JudgeStatus::Aborted.is_terminal());
        assert!(JudgeStatus::SystemError.is_terminal());
    }

    #[test]
    fn infrastructure_failures_are_not_candidate_faults() {
        assert!(JudgeStatus::MemoryLeak.is_candidate_fault());
        assert!(JudgeStatus::WrongAnswer.is_candidate_fault());
        assert!(!JudgeStatus::SystemError.is_candidate_fault());
        assert!(!JudgeStatus::Skipped.is_candidate_fault());
    }

    #[test]
    fn display_matches_wire_name() {
        for status in [
            JudgeStatus::TimeLimitExceeded,
            JudgeStatus::DiskLimitExceeded,
            JudgeStatus::Accepted,
        ] {
            let wire = serde_json::to_string(&status).unwrap();
            assert_eq!(wire, format!("\"{}\"", status));
        }
    }

    #[test]
    fn status_update_wire_format() {
        let started = serde_json::to_string(&StatusUpdate::Started).unwrap();
        assert_eq!(started, r#"{"type":"started"}"#);

        let error = StatusUpdate::Error {
            message: "boom".into(),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");

        let done = StatusUpdate::Done {
            result: JudgeResult::compile_error("main.cpp:1: error"),
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["result"]["status"], "compile_error");
        assert!(done.is_terminal());
        assert!(!StatusUpdate::Started.is_terminal());
    }
}
