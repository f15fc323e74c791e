//! Command recognition and execution.
//!
//! A Parse-and-Run job hands each parsed request to [`is_valid_command`].
//! Known verbs go to [`CommandHandler`], which touches exactly one shard per
//! key. Anything else is answered with an error reply without reaching the
//! store.

pub mod handler;
pub mod kind;

pub use handler::CommandHandler;
pub use kind::{is_valid_command, CommandKind};
