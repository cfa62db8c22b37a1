//! # livecode-collab: Real-time session layer for livecode
//!
//! Relays CRDT updates, awareness and shared executions between the peers
//! of a session, and provides the peer side that drives a replica.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per peer)  │  envelope frames   │ (relay)     │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌────────────────┐
//! │ SyncSession │                     │ SessionRegistry│
//! │ text + pres.│                     │ BroadcastGroup │
//! └─────────────┘                     └────────────────┘
//! ```
//!
//! The relay never interprets document payloads; every peer holds a full
//! replica and converges on its own.
//!
//! ## Modules
//!
//! - [`protocol`]: Envelope wire format (bincode binary, JSON text)
//! - [`broadcast`]: Per-session fan-out with bounded outboxes
//! - [`registry`]: Session lifecycle and membership
//! - [`execution`]: Shared code execution
//! - [`discovery`]: HTTP session create/lookup
//! - [`server`]: WebSocket relay
//! - [`session`]: Peer-side sync state machine
//! - [`client`]: WebSocket client driving a session
//! - [`config`]: Relay configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, SyncClient};
pub use config::{CommandSpec, ConfigError, ExecutionConfig, ServerConfig};
pub use discovery::SessionStatus;
pub use execution::{
    ExecutionOutput, ExecutionRelay, ExecutionRequest, Executor, ExecutorError, ProcessExecutor,
};
pub use protocol::{
    Envelope, ErrorCode, ExecutionState, JoinAck, JoinRequest, PeerInfo, ProtocolError, Relayed,
    SessionId, SnapshotPayload, WireFormat,
};
pub use registry::{RelayError, Session, SessionRegistry};
pub use server::{ServerStats, SyncServer};
pub use session::{EditOp, OfflineQueue, SessionError, SessionState, Step, SyncEvent, SyncSession};
