//! # PipeKV - A Staged-Pipeline In-Memory Key-Value Server
//!
//! PipeKV is a Redis-compatible, in-memory key-value server. Instead of one
//! task per client it moves every connection through three fixed-size worker
//! pools (read, parse-and-run, write) driven by a single readiness loop.
//!
//! ## Features
//!
//! - **Redis-Compatible**: Speaks RESP (and inline commands), so `redis-cli` works
//! - **Sharded Storage**: Independently locked partitions selected by key hash
//! - **Staged Pipeline**: Read, execute and write run on separate thread pools
//! - **Checked Lock Order**: Every lock carries a level; debug builds panic on inversion
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              PipeKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────────────────┐  │
//! │  │  Acceptor   │───>│ Multiplexer │───>│ Read ─> Parse-and-Run ─>    │  │
//! │  │  (thread)   │    │  (thread)   │<───│ Write        (job pools)    │  │
//! │  └─────────────┘    └─────────────┘    └──────────────┬──────────────┘  │
//! │                                                       │                 │
//! │                                                       ▼                 │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │   RESP      │    │              ShardedStore                    │   │
//! │  │   Parser    │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  │             │    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │  └─────────────┘    │  │ Mutex  │ │ Mutex  │ │ Mutex  │ │shards  │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use pipekv::{Orchestrator, ServerConfig};
//!
//! let config = ServerConfig::new(([127, 0, 0, 1], 6379)).with_workers(4);
//! let mut server = Orchestrator::start(config).unwrap();
//!
//! // ... serve until asked to stop ...
//!
//! server.shutdown();
//! ```
//!
//! ## Supported Commands
//!
//! - `GET key`
//! - `SET key value`
//! - `DEL key [key ...]`
//!
//! Command names are matched case-sensitively.
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP types and the request parser
//! - [`storage`]: Sharded key-value store
//! - [`commands`]: Command validation and execution
//! - [`connection`]: Per-connection session state and stage registries
//! - [`pool`]: Fixed-size worker pools
//! - [`server`]: Acceptor, multiplexer, pipeline jobs and the orchestrator
//! - [`sync`]: Lock-level checked mutex
//!
//! ## Design Highlights
//!
//! ### Ownership Hand-off
//!
//! A connection's session is moved by value from stage to stage. Only the
//! current owner can touch its buffers, so the session needs no lock of its
//! own. Registries record which stage owns each connection, and every stage
//! change is checked against them.
//!
//! ### Lock Hierarchy
//!
//! Locks are acquired in a fixed order: all-sockets registry, read-registered,
//! processing, write-pending, then a single shard. [`sync::OrderedMutex`]
//! tracks the levels a thread holds and rejects out-of-order acquisition.
//!
//! ### Ordered Shutdown
//!
//! [`Orchestrator::shutdown`] stops the loops, then destroys the pools
//! upstream first. Each pool drains its queue before its threads are joined,
//! so no job ever runs against a destroyed pool.

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::ServerConfig;
pub use connection::ConnectionStats;
pub use error::{ServerError, ServerResult};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::Orchestrator;
pub use storage::ShardedStore;

/// The default port PipeKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host PipeKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of PipeKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
