//! Lock hierarchy.
//!
//! Lock classes, lowest first:
//!
//! ```text
//! AllSockets -> ReadRegistered -> Processing -> WritePending -> Shard
//! ```
//!
//! A connection's own state is not behind a lock at all: it is moved by value
//! from stage to stage, so only one thread can touch it at a time.

pub mod ordered;

pub use ordered::{held_level, LockLevel, OrderedGuard, OrderedMutex};
