pub mod job;
pub mod resource;
pub mod status;

pub use job::{CheckerSpec, Job, Lane, ScoringPolicy, TestCase};
pub use resource::ResourceUsage;
pub use status::{JudgeResult, JudgeStatus, StatusUpdate, TestpointResult};
