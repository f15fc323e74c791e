//! Pipeline jobs.
//!
//! Each job takes ownership of one [`Session`], advances it by exactly one
//! stage and hands it on: to the next pool, or back to the multiplexer as a
//! [`Control`] message.
//!
//! ```text
//!        Read                 Parse-and-Run             Write
//!  ┌──────────────┐        ┌────────────────┐      ┌──────────────┐
//!  │ fill buffer  │ ─────> │ execute / reply│ ───> │ flush reply  │
//!  └──────┬───────┘        └────────────────┘      └──────┬───────┘
//!         │ incomplete                                    │ done / blocked
//!         ▼                                               ▼
//!     ReadMore                                   Rearm / AwaitWritable
//! ```
//!
//! Every failure is turned into either a reply for the client or a
//! `Control::Remove`; nothing propagates out of a job.

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::{
    ConnId, ConnectionError, ConnectionStats, Flush, Registries, Session, Stage,
};
use crate::error::ServerResult;
use crate::pool::{JobPool, PoolStats};
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::server::multiplexer::Control;
use crossbeam_channel::Sender;
use mio::{Registry, Waker};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Counters of the three stage pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub read: PoolStats,
    pub process: PoolStats,
    pub write: PoolStats,
}

/// State shared by every job, the multiplexer and the acceptor.
pub(crate) struct Pipeline {
    pub(crate) registries: Registries,
    pub(crate) stats: ConnectionStats,
    handler: CommandHandler,
    parser: RespParser,
    read_pool: JobPool,
    process_pool: JobPool,
    write_pool: JobPool,
    control: Sender<Control>,
    waker: Arc<Waker>,
    max_request_size: usize,
}

impl Pipeline {
    pub(crate) fn new(
        config: &ServerConfig,
        handler: CommandHandler,
        control: Sender<Control>,
        waker: Arc<Waker>,
    ) -> ServerResult<Self> {
        Ok(Self {
            registries: Registries::new(),
            stats: ConnectionStats::new(),
            handler,
            // A declared argument longer than the request cap can never complete
            parser: RespParser::with_max_bulk_len(config.max_request_size),
            read_pool: JobPool::new("read", config.read_workers)?,
            process_pool: JobPool::new("process", config.process_workers)?,
            write_pool: JobPool::new("write", config.write_workers)?,
            control,
            waker,
            max_request_size: config.max_request_size,
        })
    }

    /// Sends a control message to the multiplexer and wakes it.
    pub(crate) fn notify(&self, control: Control) {
        if let Err(err) = self.control.send(control) {
            let session = err.into_inner().into_session();
            self.close(session, None);
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake multiplexer");
        }
    }

    /// Tears a connection down. `registry` is the multiplexer's readiness
    /// set when the socket may still be registered in it.
    pub(crate) fn close(&self, mut session: Session, registry: Option<&Registry>) {
        let id = session.id();
        if let Some(registry) = registry {
            if let Err(e) = session.deregister(registry) {
                trace!(conn = %id, error = %e, "Deregister failed");
            }
        }

        if let Some(info) = self.registries.remove(id) {
            self.stats.connection_closed();
            info!(
                conn = %id,
                client = %info.peer,
                open_ms = info.opened_at.elapsed().as_millis() as u64,
                "Client disconnected"
            );
        }
    }

    /// Forgets a connection whose session was lost with a failed submission.
    fn discard(&self, id: ConnId, reason: &dyn Display) {
        warn!(conn = %id, reason = %reason, "Dropping connection");
        if self.registries.remove(id).is_some() {
            self.stats.connection_closed();
        }
    }

    pub(crate) fn dispatch_read(self: &Arc<Self>, session: Session) {
        self.submit(&self.read_pool, session, Self::read);
    }

    pub(crate) fn dispatch_write(self: &Arc<Self>, session: Session) {
        self.submit(&self.write_pool, session, Self::write);
    }

    fn submit(self: &Arc<Self>, pool: &JobPool, session: Session, job: fn(&Arc<Self>, Session)) {
        let id = session.id();
        let pipeline = Arc::clone(self);
        if let Err(e) = pool.submit(move || job(&pipeline, session)) {
            // The session went down with the rejected job
            self.discard(id, &e);
        }
    }

    /// Records a stage change, or removes the connection if its bookkeeping
    /// no longer matches.
    fn advance(&self, session: Session, from: Stage, to: Stage) -> Option<Session> {
        match self.registries.transition(session.id(), Some(from), to) {
            Ok(()) => Some(session),
            Err(e) => {
                error!(conn = %session.id(), error = %e, "Stage transition failed");
                self.notify(Control::Remove(session));
                None
            }
        }
    }

    fn connection_failed(&self, session: Session, err: ConnectionError) {
        if err.is_disconnect() {
            debug!(conn = %session.id(), client = %session.peer(), reason = %err, "Connection closed by peer");
        } else {
            warn!(conn = %session.id(), client = %session.peer(), error = %err, "Connection error");
        }
        self.notify(Control::Remove(session));
    }

    fn read(self: &Arc<Self>, mut session: Session) {
        debug_assert_eq!(self.registries.stage_of(session.id()), Some(Stage::ReadRegistered));

        // One byte past the cap is enough to tell an oversized request apart
        match session.fill_read_buf(self.max_request_size + 1) {
            Ok(n) => self.stats.bytes_read(n),
            Err(e) => return self.connection_failed(session, e),
        }

        if !session.parse_next(&self.parser) {
            let buffered = session.buffered_input();
            if buffered <= self.max_request_size {
                self.notify(Control::ReadMore(session));
                return;
            }
            warn!(conn = %session.id(), buffered = buffered, "Request size limit exceeded");
            session.reject(ParseError::MessageTooLarge {
                size: buffered,
                max: self.max_request_size,
            });
        }

        if let Some(session) = self.advance(session, Stage::ReadRegistered, Stage::Processing) {
            self.submit(&self.process_pool, session, Self::process);
        }
    }

    fn process(self: &Arc<Self>, mut session: Session) {
        debug_assert_eq!(self.registries.stage_of(session.id()), Some(Stage::Processing));

        let reply = match session.take_command() {
            Some(Ok(command)) => {
                self.stats.command_processed();
                self.handler.execute(command)
            }
            Some(Err(e)) => {
                debug!(conn = %session.id(), error = %e, "Parse error");
                self.stats.protocol_error();
                session.discard_input();
                if e.is_fatal() {
                    session.set_close_after_write();
                }
                RespValue::error(format!("ERR Protocol error: {}", e))
            }
            None => {
                error!(conn = %session.id(), "No request buffered for processing");
                self.notify(Control::Remove(session));
                return;
            }
        };

        session.queue_reply(&reply);

        if let Some(session) = self.advance(session, Stage::Processing, Stage::WritePending) {
            self.submit(&self.write_pool, session, Self::write);
        }
    }

    fn write(self: &Arc<Self>, mut session: Session) {
        debug_assert_eq!(self.registries.stage_of(session.id()), Some(Stage::WritePending));

        match session.flush() {
            Ok(Flush::Done(n)) => {
                self.stats.bytes_written(n);
                if session.close_after_write() {
                    debug!(conn = %session.id(), "Closing after error reply");
                    self.notify(Control::Remove(session));
                } else if let Some(session) =
                    self.advance(session, Stage::WritePending, Stage::ReadRegistered)
                {
                    self.notify(Control::Rearm(session));
                }
            }
            Ok(Flush::Blocked(n)) => {
                self.stats.bytes_written(n);
                self.notify(Control::AwaitWritable(session));
            }
            Err(e) => self.connection_failed(session, e),
        }
    }

    /// Destroys the stage pools upstream first. When this returns no job is
    /// running and none can start.
    pub(crate) fn destroy_pools(&self) {
        self.read_pool.destroy();
        self.process_pool.destroy();
        self.write_pool.destroy();
    }

    pub(crate) fn pool_stats(&self) -> PipelineStats {
        PipelineStats {
            read: self.read_pool.stats(),
            process: self.process_pool.stats(),
            write: self.write_pool.stats(),
        }
    }
}
