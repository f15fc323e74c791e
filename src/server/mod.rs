//! Server Module
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐  Add   ┌──────────────────────────────────────────┐
//!  │ pipekv-accept│ ─────> │ pipekv-poll (Multiplexer)                │
//!  │  (Acceptor)  │        │  parked sessions, readiness set, waker   │
//!  └──────────────┘        └───────┬───────────────────────▲──────────┘
//!                                  │ readable / writable   │ Control
//!                                  ▼                       │
//!                 ┌────────────┐   ┌───────────────┐   ┌───┴────────┐
//!                 │ read pool  │──>│ process pool  │──>│ write pool │
//!                 └────────────┘   └───────┬───────┘   └────────────┘
//!                                          │
//!                                          ▼
//!                                   ShardedStore
//! ```
//!
//! A connection's [`Session`](crate::connection::Session) is owned by exactly
//! one box in this picture at any moment. At most one request per connection
//! is in flight: the socket is re-armed only after its reply is written.

mod acceptor;
mod multiplexer;
pub mod orchestrator;
mod pipeline;
pub mod shutdown;

pub use orchestrator::Orchestrator;
pub use pipeline::PipelineStats;
pub use shutdown::ShutdownSignal;
