//! Connection Module
//!
//! Per-connection state and the registries that track which pipeline stage
//! currently owns each connection.
//!
//! ## Lifecycle
//!
//! ```text
//!   accept ──> Session::new ──> Registries::insert
//!                                    │
//!                                    ▼
//!          ┌─────────────── read-registered <──────────────┐
//!          │                        │                      │
//!          │             complete request                  │
//!          │                        ▼                      │
//!          │                   processing                  │
//!          │                        │                      │
//!          │                 reply queued                  │
//!          │                        ▼                      │
//!          │                  write-pending ── flushed ────┘
//!          │                        │
//!          └──── close / error ─────┴──> Registries::remove
//! ```
//!
//! The `Session` itself moves by value along this path; the registries only
//! record where it is so that stage changes can be checked and so that
//! teardown can find every connection.

pub mod registry;
pub mod session;
pub mod stats;

// Re-export commonly used types
pub use registry::{ConnInfo, Registries, RegistryCounts, RegistryError, Stage};
pub use session::{ConnId, ConnectionError, Flush, Session};
pub use stats::ConnectionStats;
