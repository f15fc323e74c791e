//! Command Handler
//!
//! Executes a parsed request against the sharded store and produces the reply.
//!
//! - `GET key` - bulk string, or nil when the key is absent
//! - `SET key value` - `+OK`
//! - `DEL key [key ...]` - number of keys removed
//!
//! Anything else yields an error reply without touching the store.

use crate::commands::kind::{is_valid_command, CommandKind};
use crate::protocol::RespValue;
use crate::storage::ShardedStore;
use bytes::Bytes;
use std::sync::Arc;

/// Dispatches requests to the store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<ShardedStore>,
}

impl CommandHandler {
    pub fn new(storage: Arc<ShardedStore>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<ShardedStore> {
        &self.storage
    }

    /// Executes a request and returns the reply to send back.
    pub fn execute(&self, command: RespValue) -> RespValue {
        let kind = is_valid_command(&command);

        let args = match command {
            RespValue::Array(args) if !args.is_empty() => args,
            _ => return RespValue::error("ERR invalid command format"),
        };

        match kind {
            CommandKind::Get => self.cmd_get(&args[1..]),
            CommandKind::Set => self.cmd_set(&args[1..]),
            CommandKind::Del => self.cmd_del(&args[1..]),
            CommandKind::Invalid => match args[0].as_bytes() {
                Some(name) => RespValue::error(format!("ERR unknown command '{}'", printable(name))),
                None => RespValue::error("ERR invalid command format"),
            },
        }
    }

    fn get_bytes(&self, value: &RespValue) -> Option<Bytes> {
        match value {
            RespValue::BulkString(b) => Some(b.clone()),
            RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
            _ => None,
        }
    }

    /// GET key
    fn cmd_get(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_arity(CommandKind::Get);
        }

        let key = match self.get_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error("ERR invalid key"),
        };

        match self.storage.get(&key) {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        }
    }

    /// SET key value
    fn cmd_set(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 2 {
            return wrong_arity(CommandKind::Set);
        }

        let key = match self.get_bytes(&args[0]) {
            Some(k) => k,
            None => return RespValue::error("ERR invalid key"),
        };
        let value = match self.get_bytes(&args[1]) {
            Some(v) => v,
            None => return RespValue::error("ERR invalid value"),
        };

        self.storage.set(key, value);
        RespValue::ok()
    }

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() {
            return wrong_arity(CommandKind::Del);
        }

        let keys: Option<Vec<Bytes>> = args.iter().map(|a| self.get_bytes(a)).collect();
        let keys = match keys {
            Some(keys) => keys,
            None => return RespValue::error("ERR invalid key"),
        };

        let deleted = self.storage.delete_many(&keys);
        RespValue::integer(deleted as i64)
    }
}

fn wrong_arity(kind: CommandKind) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        kind
    ))
}

/// Renders a client-supplied token for an error line. Line breaks would end
/// the reply early, so they become spaces.
fn printable(token: &[u8]) -> String {
    String::from_utf8_lossy(token).replace(['\r', '\n'], " ")
}
