//! Readiness multiplexer.
//!
//! A single thread owns the poll set. Sessions waiting for readiness are
//! parked here; everything else reaches the thread as a [`Control`] message
//! followed by a wake of [`WAKER_TOKEN`].

use crate::connection::{ConnId, Session, Stage};
use crate::server::pipeline::Pipeline;
use crate::server::shutdown::ShutdownSignal;
use crossbeam_channel::Receiver;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Token of the waker in every poll set. Connection ids never reach it.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Requests sent to the multiplexer thread. Each carries the session it
/// concerns, handing ownership back to the multiplexer.
#[derive(Debug)]
pub(crate) enum Control {
    /// A freshly accepted connection.
    Add(Session),
    /// Input so far is an incomplete request; wait for more.
    ReadMore(Session),
    /// A reply has been fully written; start the next request.
    Rearm(Session),
    /// The socket stopped accepting the reply; resume when writable.
    AwaitWritable(Session),
    /// Tear the connection down.
    Remove(Session),
}

impl Control {
    pub(crate) fn into_session(self) -> Session {
        match self {
            Control::Add(s)
            | Control::ReadMore(s)
            | Control::Rearm(s)
            | Control::AwaitWritable(s)
            | Control::Remove(s) => s,
        }
    }
}

/// Why a session is parked.
#[derive(Debug)]
enum Parked {
    Read(Session),
    Write(Session),
}

pub(crate) struct Multiplexer {
    poll: Poll,
    control: Receiver<Control>,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<ShutdownSignal>,
    parked: HashMap<ConnId, Parked>,
    max_events: usize,
}

impl Multiplexer {
    /// `poll` must already carry a waker registered under [`WAKER_TOKEN`].
    pub(crate) fn new(
        poll: Poll,
        control: Receiver<Control>,
        pipeline: Arc<Pipeline>,
        shutdown: Arc<ShutdownSignal>,
        max_events: usize,
    ) -> Self {
        Self {
            poll,
            control,
            pipeline,
            shutdown,
            parked: HashMap::new(),
            max_events,
        }
    }

    /// Runs the event loop until shutdown is signalled, then closes every
    /// connection still parked here.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(self.max_events);
        info!("Multiplexer started");

        while !self.shutdown.is_triggered() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed, stopping multiplexer");
                break;
            }

            for event in events.iter() {
                if event.token() != WAKER_TOKEN {
                    self.ready(ConnId::from(event.token()));
                }
            }

            self.drain_control();
        }

        let remaining = self.parked.len();
        for (_, parked) in self.parked.drain() {
            let session = match parked {
                Parked::Read(s) | Parked::Write(s) => s,
            };
            self.pipeline.close(session, Some(self.poll.registry()));
        }
        info!(closed = remaining, "Multiplexer stopped");
    }

    /// Hands a session whose socket became ready to the matching pool.
    fn ready(&mut self, id: ConnId) {
        match self.parked.remove(&id) {
            Some(Parked::Read(session)) => self.pipeline.dispatch_read(session),
            Some(Parked::Write(session)) => self.pipeline.dispatch_write(session),
            // Owned by a job right now; it re-registers when it comes back
            None => trace!(conn = %id, "Readiness for busy connection"),
        }
    }

    fn drain_control(&mut self) {
        while let Ok(control) = self.control.try_recv() {
            self.apply(control);
        }
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::Add(mut session) => {
                let id = session.id();
                if let Err(e) = self.pipeline.registries.transition(id, None, Stage::ReadRegistered) {
                    error!(conn = %id, error = %e, "Cannot arm new connection");
                    return self.pipeline.close(session, None);
                }
                match session.register(self.poll.registry(), Interest::READABLE) {
                    Ok(()) => {
                        debug!(conn = %id, "Registered for reading");
                        self.parked.insert(id, Parked::Read(session));
                    }
                    Err(e) => {
                        error!(conn = %id, error = %e, "Failed to register connection");
                        self.pipeline.close(session, None);
                    }
                }
            }
            Control::ReadMore(session) => self.park(session, Interest::READABLE),
            Control::Rearm(session) => {
                if session.has_buffered_input() {
                    // Pipelined requests already read; no readiness edge will come for them
                    self.pipeline.dispatch_read(session);
                } else {
                    self.park(session, Interest::READABLE);
                }
            }
            Control::AwaitWritable(session) => self.park(session, Interest::WRITABLE),
            Control::Remove(session) => self.pipeline.close(session, Some(self.poll.registry())),
        }
    }

    /// Re-arms the socket for `interest` and keeps the session until it fires.
    fn park(&mut self, mut session: Session, interest: Interest) {
        let id = session.id();
        if let Err(e) = session.reregister(self.poll.registry(), interest) {
            error!(conn = %id, error = %e, "Failed to re-arm connection");
            return self.pipeline.close(session, Some(self.poll.registry()));
        }

        let parked = if interest.is_writable() {
            Parked::Write(session)
        } else {
            Parked::Read(session)
        };
        if self.parked.insert(id, parked).is_some() {
            error!(conn = %id, "Connection parked twice");
        }
    }
}
