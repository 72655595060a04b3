use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::resource::ResourceUsage;
use crate::task::status::{JudgeStatus, TestpointResult};

/// Language lane of a submission. Each lane has its own build and run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "language", rename_all = "snake_case")]
pub enum Lane {
    /// Single C++ translation unit fetched from object storage.
    Cpp { source: String },
    /// Git repository checked out and built with make or CMake.
    Git { repository: String },
    /// Verilog source compiled with iverilog and simulated with vvp.
    Verilog { source: String },
}

impl Lane {
    pub fn name(&self) -> &'static str {
        match self {
            Lane::Cpp { .. } => "cpp",
            Lane::Git { .. } => "git",
            Lane::Verilog { .. } => "verilog",
        }
    }

    /// Source artifact to resolve through the cache, if the lane has one.
    pub fn source_locator(&self) -> Option<&str> {
        match self {
            Lane::Cpp { source } | Lane::Verilog { source } => Some(source),
            Lane::Git { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckerSpec {
    /// Whitespace-tolerant textual comparison with the answer file.
    #[default]
    Diff,
    /// Problem-specific checker executable fetched from object storage.
    Custom { executable: String },
}

/// How test case outcomes are combined into the job's verdict and score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPolicy {
    /// Stop at the first failing case; later cases are reported as skipped.
    #[default]
    StopOnFirstFailure,
    /// Run every case and sum the scores of the accepted ones.
    RunAll,
}

impl ScoringPolicy {
    /// Whether judging continues after a case finished with `status`.
    pub fn continues_after(&self, status: JudgeStatus) -> bool {
        match self {
            ScoringPolicy::StopOnFirstFailure => status.is_accepted(),
            ScoringPolicy::RunAll => true,
        }
    }

    /// Combine per-case outcomes into the job status and total score.
    ///
    /// The status is the first non-accepted, non-skipped case status, or
    /// `accepted` when every case passed.
    pub fn aggregate(&self, testpoints: &[TestpointResult]) -> (JudgeStatus, f64) {
        let status = testpoints
            .iter()
            .map(|t| t.status)
            .find(|s| !s.is_accepted() && *s != JudgeStatus::Skipped)
            .unwrap_or(JudgeStatus::Accepted);
        let score = testpoints
            .iter()
            .filter(|t| t.status.is_accepted())
            .map(|t| t.score)
            .sum();
        (status, score)
    }
}

fn default_score() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    /// Locator of the stdin file; no stdin when absent.
    #[serde(default)]
    pub input: Option<String>,
    /// Locator of the expected output; the checker is skipped when absent.
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default = "default_score")]
    pub score: f64,
    /// Overrides the job-wide limits for this case.
    #[serde(default)]
    pub limits: Option<ResourceUsage>,
}

/// One unit of judging work, as serialized into the payload channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub submission_id: String,
    pub lane: Lane,
    #[serde(default)]
    pub limits: ResourceUsage,
    #[serde(default)]
    pub testcases: Vec<TestCase>,
    #[serde(default)]
    pub checker: CheckerSpec,
    #[serde(default)]
    pub policy: ScoringPolicy,
    /// Wrap the run stage in valgrind memcheck.
    #[serde(default)]
    pub memcheck: bool,
    /// Where to upload the built executable, if anywhere.
    #[serde(default)]
    pub artifact_upload: Option<String>,
}

impl Job {
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn limits_for(&self, testcase: &TestCase) -> ResourceUsage {
        testcase.limits.unwrap_or(self.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, status: JudgeStatus, score: f64) -> TestpointResult {
        TestpointResult {
            id: id.to_string(),
            status,
            score,
            message: None,
            resource_usage: None,
        }
    }

    #[test]
    fn job_parses_with_defaults() {
        let job = Job::from_json(
            r#"{
                "submission_id": "t1",
                "lane": {"language": "cpp", "source": "http://store/code/1.cpp"},
                "limits": {"time_msecs": 1000, "memory_bytes": 268435456},
                "testcases": [{"id": "1", "input": "http://store/data/1.in"}]
            }"#,
        )
        .unwrap();

        assert_eq!(job.submission_id, "t1");
        assert_eq!(job.lane.name(), "cpp");
        assert_eq!(job.lane.source_locator(), Some("http://store/code/1.cpp"));
        assert_eq!(job.checker, CheckerSpec::Diff);
        assert_eq!(job.policy, ScoringPolicy::StopOnFirstFailure);
        assert!(!job.memcheck);
        assert_eq!(job.testcases[0].score, 1.0);
        assert_eq!(job.limits_for(&job.testcases[0]).time_msecs, 1000);
    }

    #[test]
    fn per_case_limits_override_job_limits() {
        let mut job = Job::from_json(
            r#"{"submission_id": "s", "lane": {"language": "git", "repository": "https://git/x"},
                "limits": {"time_msecs": 1000}, "testcases": [{"id": "a"}]}"#,
        )
        .unwrap();
        job.testcases[0].limits = Some(ResourceUsage::new(5000, -1));
        assert_eq!(job.limits_for(&job.testcases[0]).time_msecs, 5000);
        assert_eq!(job.lane.source_locator(), None);
    }

    #[test]
    fn stop_on_first_failure_halts_after_failure() {
        let policy = ScoringPolicy::StopOnFirstFailure;
        assert!(policy.continues_after(JudgeStatus::Accepted));
        assert!(!policy.continues_after(JudgeStatus::WrongAnswer));
        assert!(ScoringPolicy::RunAll.continues_after(JudgeStatus::WrongAnswer));
    }

    #[test]
    fn aggregate_reports_first_failure_and_sums_accepted() {
        let points = vec![
            point("1", JudgeStatus::Accepted, 10.0),
            point("2", JudgeStatus::TimeLimitExceeded, 10.0),
            point("3", JudgeStatus::WrongAnswer, 10.0),
            point("4", JudgeStatus::Accepted, 5.0),
        ];
        let (status, score) = ScoringPolicy::RunAll.aggregate(&points);
        assert_eq!(status, JudgeStatus::TimeLimitExceeded);
        assert_eq!(score, 15.0);
    }

    #[test]
    fn aggregate_ignores_skipped_cases() {
        let points = vec![
            point("1", JudgeStatus::Accepted, 1.0),
            TestpointResult::skipped("2"),
        ];
        let (status, score) = ScoringPolicy::StopOnFirstFailure.aggregate(&points);
        assert_eq!(status, JudgeStatus::Accepted);
        assert_eq!(score, 1.0);
    }
}
