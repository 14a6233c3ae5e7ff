//! Per-channel rate-limited task dispatch.
//!
//! This crate provides:
//! - `TokenBucket` credit limiter, one per channel
//! - `TaskUnit` trait for opaque units of work
//! - `Dispatcher` owning one FIFO and one worker per named channel,
//!   with exponential-backoff retries

mod channel;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod task;

pub use dispatcher::Dispatcher;
pub use error::QueueError;
pub use limiter::TokenBucket;
pub use task::{FnTask, Task, TaskUnit};
