//! Accept loop.

use crate::config::ServerConfig;
use crate::connection::{ConnId, Session};
use crate::error::{ServerError, ServerResult};
use crate::server::multiplexer::{Control, WAKER_TOKEN};
use crate::server::pipeline::Pipeline;
use crate::server::shutdown::ShutdownSignal;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Token for the listener socket.
const LISTENER_TOKEN: Token = Token(0);

/// Accepts connections and hands them to the multiplexer.
pub(crate) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<ShutdownSignal>,
    next_id: usize,
    max_connections: usize,
    read_buffer_size: usize,
}

impl Acceptor {
    pub(crate) fn new(
        mut listener: TcpListener,
        pipeline: Arc<Pipeline>,
        shutdown: Arc<ShutdownSignal>,
        config: &ServerConfig,
    ) -> ServerResult<Self> {
        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poll)?;
        shutdown.register(Arc::new(waker));

        Ok(Self {
            poll,
            listener,
            pipeline,
            shutdown,
            next_id: 1,
            max_connections: config.max_connections,
            read_buffer_size: config.read_buffer_size,
        })
    }

    /// Runs until shutdown is signalled. The listener closes when this returns.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(128);
        info!("Accept loop started");

        while !self.shutdown.is_triggered() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "Accept poll failed, stopping accept loop");
                break;
            }

            if events.iter().any(|event| event.token() == LISTENER_TOKEN) {
                self.accept_pending();
            }
        }

        info!("Accept loop stopped");
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Never fatal; the next readiness event tries again
                    warn!(error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.pipeline.registries.len() >= self.max_connections {
            warn!(
                client = %addr,
                max = self.max_connections,
                "Max connections reached, rejecting connection"
            );
            self.pipeline.stats.connection_rejected();
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnId(self.next_id);
        self.next_id += 1;

        self.pipeline.registries.insert(id, addr);
        self.pipeline.stats.connection_opened();
        info!(conn = %id, client = %addr, "Client connected");

        let session = Session::new(id, stream, addr, self.read_buffer_size);
        self.pipeline.notify(Control::Add(session));
    }
}
