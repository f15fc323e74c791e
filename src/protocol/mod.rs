//! RESP Protocol
//!
//! The wire format spoken between clients and the server: a small subset of
//! the Redis Serialization Protocol. The pipeline only relies on the parser
//! answering "complete?, value-or-error, bytes consumed" for a buffer.
//!
//! ## Modules
//!
//! - `types`: `RespValue` and reply serialization
//! - `parser`: incremental request parser
//!
//! ## Example
//!
//! ```
//! use pipekv::protocol::{parse_message, RespValue};
//!
//! let (request, consumed) = parse_message(b"GET foo\r\n").unwrap().unwrap();
//! assert_eq!(consumed, 9);
//!
//! let reply = RespValue::null();
//! assert_eq!(reply.serialize(), b"$-1\r\n");
//! # let _ = request;
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
