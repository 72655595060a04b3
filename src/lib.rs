pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod queue;
pub mod shutdown;
pub mod task;
pub mod worker;
