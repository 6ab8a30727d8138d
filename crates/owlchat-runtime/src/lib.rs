//! owlchat Runtime Engine
//!
//! This crate drives the owlchat protocol over real (or in-memory)
//! connections:
//! - `Engine`: the collaborator API: operations in, notifications out
//! - `Session`: root owner of connections, pending requests and login state
//! - `Scheduler`: the single-threaded readiness loop with timers
//! - Handshake, redirect and rate-limit handling for every connection kind
//!
//! `owlchat-core` provides the wire codec and types; nothing in this crate
//! spawns threads.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod connection;
pub mod dispatch;
pub mod engine;
mod handshake;
pub mod login;
pub mod memory;
pub mod pending;
pub mod scheduler;
mod services;
pub mod session;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use connection::{ConnId, ConnState, Connection, ServicePhase};
pub use dispatch::{ConnectionEvent, Dispatched, EventKind, HandlerTable};
pub use engine::{Engine, CLIENT_BINARY_NAME, DEFAULT_GROUP};
pub use login::{LoginAuditEntry, LoginEvent, LoginMachine, LoginState};
pub use memory::{ManualTimeSource, MemoryEndpoint, MemoryNetwork};
pub use pending::{PendingRequest, PendingTable, Reply};
pub use scheduler::{Scheduler, TimerId, TimerList};
pub use session::{Session, SessionStats};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

// Re-export core types for convenience
pub use owlchat_core::{
    ConnectionKind, EngineConfig, LoginFailure, MessageFlags, Notification, OwlchatError, Result,
};
