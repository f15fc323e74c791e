//! Command recognition.

use crate::protocol::RespValue;
use std::fmt;

/// The verbs the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Invalid,
    Get,
    Del,
    Set,
}

/// Fixed lookup from command token to kind. Matching is exact and
/// case-sensitive.
const COMMAND_TABLE: &[(&[u8], CommandKind)] = &[
    (b"GET", CommandKind::Get),
    (b"DEL", CommandKind::Del),
    (b"SET", CommandKind::Set),
];

impl CommandKind {
    /// Looks up a command token.
    pub fn from_token(token: &[u8]) -> Self {
        COMMAND_TABLE
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, kind)| *kind)
            .unwrap_or(CommandKind::Invalid)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Invalid => "INVALID",
            CommandKind::Get => "GET",
            CommandKind::Del => "DEL",
            CommandKind::Set => "SET",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classifies a parsed request by its first element.
///
/// Anything that is not a non-empty array whose first element is a string
/// naming a known command is `Invalid`.
///
/// ```
/// use pipekv::commands::{is_valid_command, CommandKind};
/// use pipekv::protocol::parse_message;
///
/// let (request, _) = parse_message(b"GET foo\r\n").unwrap().unwrap();
/// assert_eq!(is_valid_command(&request), CommandKind::Get);
///
/// let (request, _) = parse_message(b"get foo\r\n").unwrap().unwrap();
/// assert_eq!(is_valid_command(&request), CommandKind::Invalid);
/// ```
pub fn is_valid_command(command: &RespValue) -> CommandKind {
    match command {
        RespValue::Array(args) => args
            .first()
            .and_then(RespValue::as_bytes)
            .map(CommandKind::from_token)
            .unwrap_or(CommandKind::Invalid),
        _ => CommandKind::Invalid,
    }
}
