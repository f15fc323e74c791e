//! Server configuration.

use crate::error::{ServerError, ServerResult};
use crate::storage::DEFAULT_SHARDS;
use std::net::SocketAddr;

/// Default number of threads in each pipeline pool.
pub const DEFAULT_WORKERS: usize = 8;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Number of store partitions. Fixed for the life of the process.
    pub shard_count: usize,
    /// Threads in the Read pool.
    pub read_workers: usize,
    /// Threads in the Parse-and-Run pool.
    pub process_workers: usize,
    /// Threads in the Write pool.
    pub write_workers: usize,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Initial capacity of each connection's read buffer.
    pub read_buffer_size: usize,
    /// Largest amount of unparsed input a connection may buffer. A request
    /// that grows past this is rejected and the connection closed.
    pub max_request_size: usize,
    /// Maximum readiness events handled per poll iteration.
    pub max_events: usize,
}

impl ServerConfig {
    /// Creates a configuration with default sizing bound to `bind_addr`.
    pub fn new(bind_addr: impl Into<SocketAddr>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Sets the same worker count for all three pipeline pools.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.read_workers = workers;
        self.process_workers = workers;
        self.write_workers = workers;
        self
    }

    pub fn with_read_workers(mut self, workers: usize) -> Self {
        self.read_workers = workers;
        self
    }

    pub fn with_process_workers(mut self, workers: usize) -> Self {
        self.process_workers = workers;
        self
    }

    pub fn with_write_workers(mut self, workers: usize) -> Self {
        self.write_workers = workers;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    pub fn with_max_events(mut self, events: usize) -> Self {
        self.max_events = events;
        self
    }

    /// Rejects sizings the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        let checks = [
            ("shard_count", self.shard_count),
            ("read_workers", self.read_workers),
            ("process_workers", self.process_workers),
            ("write_workers", self.write_workers),
            ("max_connections", self.max_connections),
            ("read_buffer_size", self.read_buffer_size),
            ("max_request_size", self.max_request_size),
            ("max_events", self.max_events),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(ServerError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            shard_count: DEFAULT_SHARDS,
            read_workers: DEFAULT_WORKERS,
            process_workers: DEFAULT_WORKERS,
            write_workers: DEFAULT_WORKERS,
            max_connections: 1024,
            read_buffer_size: 4 * 1024,
            max_request_size: 64 * 1024,
            max_events: 1024,
        }
    }
}
