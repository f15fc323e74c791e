//! Job Pool
//!
//! A generic "run this closure somewhere" capability. The server owns three
//! of them, one per pipeline stage, and relies only on this contract:
//!
//! - `submit(job)` queues a job for asynchronous execution, or fails once the
//!   pool has been destroyed
//! - `destroy()` stops accepting jobs, then blocks until every job submitted
//!   before it has completed

pub mod job_pool;

pub use job_pool::{Job, JobPool, PoolError, PoolStats};
