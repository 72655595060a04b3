//! Queue protocol between the scheduler and runners.
//!
//! The scheduler pushes job ids onto a per-group pending list and the job
//! itself into a per-job payload key. A runner claims an id by moving it
//! into its own in-progress marker in one atomic step, then talks back
//! through the job's progress channel and listens on its abort channel.
//!
//! - [`QueueStore`]: list/key primitives, backed by Redis ([`RedisStore`]) or
//!   in process ([`MemoryStore`])
//! - [`QueueNames`] / [`JobChannels`]: key layout
//! - [`QueueClient`]: the protocol on top of a store

pub mod client;
pub mod memory;
pub mod names;
pub mod store;

pub use client::QueueClient;
pub use memory::MemoryStore;
pub use names::{JobChannels, QueueNames};
pub use store::{QueueStore, RedisStore};
