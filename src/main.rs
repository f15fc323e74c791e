//! PipeKV - A Staged-Pipeline In-Memory Key-Value Server
//!
//! This is the main entry point for the PipeKV server.
//! It parses the command line, sets up logging, starts the orchestrator and
//! shuts it down in order on Ctrl+C.

use anyhow::Context;
use clap::Parser;
use pipekv::config::DEFAULT_WORKERS;
use pipekv::storage::DEFAULT_SHARDS;
use pipekv::{Orchestrator, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// PipeKV - A Staged-Pipeline In-Memory Key-Value Server
#[derive(Parser, Debug)]
#[command(name = "pipekv")]
#[command(version = pipekv::VERSION)]
#[command(about = "In-memory key-value server speaking RESP", long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = pipekv::DEFAULT_HOST, env = "PIPEKV_HOST")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = pipekv::DEFAULT_PORT, env = "PIPEKV_PORT")]
    port: u16,

    /// Number of store shards
    #[arg(long, default_value_t = DEFAULT_SHARDS, env = "PIPEKV_SHARDS")]
    shards: usize,

    /// Threads in the read pool
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "PIPEKV_READ_WORKERS")]
    read_workers: usize,

    /// Threads in the parse-and-run pool
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "PIPEKV_PROCESS_WORKERS")]
    process_workers: usize,

    /// Threads in the write pool
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "PIPEKV_WRITE_WORKERS")]
    write_workers: usize,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 1024, env = "PIPEKV_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info", env = "PIPEKV_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig::new(SocketAddr::new(self.host, self.port))
            .with_shard_count(self.shards)
            .with_read_workers(self.read_workers)
            .with_process_workers(self.process_workers)
            .with_write_workers(self.write_workers)
            .with_max_connections(self.max_connections)
    }
}

fn print_banner(server: &Orchestrator, config: &ServerConfig) {
    println!(
        r#"
PipeKV v{} - Staged-Pipeline In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Server started on {}
Shards: {}   Workers: read {} / process {} / write {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        pipekv::VERSION,
        server.local_addr(),
        config.shard_count,
        config.read_workers,
        config.process_workers,
        config.write_workers,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = args.server_config();
    let mut server = Orchestrator::start(config.clone()).context("failed to start server")?;

    print_banner(&server, &config);

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    // Joins threads and drains pools, so keep it off the async workers
    let server = tokio::task::spawn_blocking(move || {
        server.shutdown();
        server
    })
    .await
    .context("shutdown task failed")?;

    let stats = server.stats();
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        keys = server.store().len(),
        "Server shutdown complete"
    );
    Ok(())
}
