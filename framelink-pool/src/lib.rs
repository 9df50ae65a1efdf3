//! Priority job pool.
//!
//! A [`Pool`] owns a set of worker threads. Each worker is configured with an
//! ordered list of [`JobPriority`] classes it is willing to execute and drains
//! them strictly in that order, so a worker given `[Normal, High]` only falls
//! back to `High` when `Normal` is empty. Five classes exist; each one is a
//! FIFO queue. `Top` is reserved by convention for urgent socket writes and
//! `LongTerm` for unbounded driver loops.

mod job;
mod pool;
mod priority;

pub use job::{Job, JobError, JobResult};
pub use pool::{Pool, PoolError};
pub use priority::JobPriority;
