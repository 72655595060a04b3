//! Judging engine of a runner node.
//!
//! - [`executor`]: runs one external program under rlimits, a wall-clock
//!   deadline and a cancellation token, and classifies how it ended
//! - [`toolchain`]: per-lane build steps (g++, git + make/CMake, iverilog)
//!   and the command line a built artifact runs with
//! - [`checker`]: textual diff or problem-specific checker
//! - [`pipeline`]: Fetch → Compile → Run → Compare for one job
//! - [`runner`]: the main loop pulling jobs from the queue
//! - [`heartbeat`]: liveness signal for the scheduler
//!
//! # Job flow
//!
//! 1. [`JobRunner`] claims a job id and reports `Started`
//! 2. [`Pipeline`] judges it in a scratch directory, while the runner waits
//!    on the job's abort channel
//! 3. Whichever finishes first wins: a verdict is reported as `Done`, an
//!    abort cancels the pipeline's token and nothing more is reported
//! 4. The job id leaves the in-progress marker

pub mod checker;
pub mod executor;
pub mod heartbeat;
pub mod pipeline;
pub mod runner;
pub mod toolchain;

pub use executor::{ExecutionResult, Executor, Invocation, Termination};
pub use heartbeat::HeartbeatSender;
pub use pipeline::{Judge, Pipeline};
pub use runner::{JobOutcome, JobRunner};
