//! Orchestrator: owns every thread, pool and registry of a running server.

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::{ConnectionStats, RegistryCounts};
use crate::error::{ServerError, ServerResult};
use crate::server::acceptor::Acceptor;
use crate::server::multiplexer::{Control, Multiplexer, WAKER_TOKEN};
use crate::server::pipeline::{Pipeline, PipelineStats};
use crate::server::shutdown::ShutdownSignal;
use crate::storage::ShardedStore;
use crossbeam_channel::Receiver;
use mio::net::TcpListener;
use mio::{Poll, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// A running server.
///
/// Dropping it shuts the server down.
///
/// # Example
///
/// ```no_run
/// use pipekv::{Orchestrator, ServerConfig};
///
/// let mut server = Orchestrator::start(ServerConfig::default()).unwrap();
/// println!("listening on {}", server.local_addr());
/// server.shutdown();
/// ```
pub struct Orchestrator {
    local_addr: SocketAddr,
    store: Arc<ShardedStore>,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<ShutdownSignal>,
    /// Kept so that sessions handed back after the multiplexer stopped are
    /// still reachable for teardown.
    control: Receiver<Control>,
    accept_thread: Option<JoinHandle<()>>,
    poll_thread: Option<JoinHandle<()>>,
    stopped: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.pipeline.registries.counts())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Orchestrator {
    /// Binds the listener, starts the pools and the accept and poll threads.
    pub fn start(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let addr = config.bind_addr;
        let listener =
            TcpListener::bind(addr).map_err(|source| ServerError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?);
        let (sender, receiver) = crossbeam_channel::unbounded();

        let store = Arc::new(ShardedStore::with_shards(config.shard_count));
        let handler = CommandHandler::new(Arc::clone(&store));
        let pipeline = Arc::new(Pipeline::new(&config, handler, sender, Arc::clone(&waker))?);

        let shutdown = Arc::new(ShutdownSignal::new());
        shutdown.register(waker);

        // From here on, an early return drops `orchestrator`, which stops
        // whatever was already started
        let mut orchestrator = Self {
            local_addr,
            store,
            pipeline: Arc::clone(&pipeline),
            shutdown: Arc::clone(&shutdown),
            control: receiver.clone(),
            accept_thread: None,
            poll_thread: None,
            stopped: false,
        };

        let multiplexer = Multiplexer::new(
            poll,
            receiver,
            Arc::clone(&pipeline),
            Arc::clone(&shutdown),
            config.max_events,
        );
        orchestrator.poll_thread = Some(spawn("poll", move || multiplexer.run())?);

        let acceptor = Acceptor::new(listener, pipeline, shutdown, &config)?;
        orchestrator.accept_thread = Some(spawn("accept", move || acceptor.run())?);

        info!(
            addr = %local_addr,
            shards = config.shard_count,
            read_workers = config.read_workers,
            process_workers = config.process_workers,
            write_workers = config.write_workers,
            "Server started"
        );

        Ok(orchestrator)
    }

    /// Address the listener is bound to. Resolves port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.pipeline.stats
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    pub fn registry_counts(&self) -> RegistryCounts {
        self.pipeline.registries.counts()
    }

    pub fn pool_stats(&self) -> PipelineStats {
        self.pipeline.pool_stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stops the server. Blocks until every job already submitted has
    /// finished and every connection is closed. Calling it again is a no-op.
    ///
    /// 1. signal the accept and poll loops and join both threads
    /// 2. destroy the read, process and write pools, in that order, so each
    ///    drains into a pool that is still accepting work
    /// 3. close the sessions that were handed back after the multiplexer
    ///    stopped, then forget anything still registered
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("Shutting down server");
        self.shutdown.trigger();

        join("accept", self.accept_thread.take());
        join("poll", self.poll_thread.take());

        self.pipeline.destroy_pools();

        let mut returned = 0;
        for control in self.control.try_iter() {
            self.pipeline.close(control.into_session(), None);
            returned += 1;
        }

        let leftover = self.pipeline.registries.clear();
        if leftover > 0 {
            warn!(leftover = leftover, "Connections still registered after teardown");
        }

        info!(closed_after_stop = returned, "Server shutdown complete");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<F>(name: &'static str, body: F) -> ServerResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("pipekv-{}", name))
        .spawn(body)
        .map_err(|source| ServerError::Spawn { name, source })
}

fn join(name: &'static str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!(thread = name, "Thread panicked");
        }
    }
}
