//! # Session Server Library
//!
//! The authoritative multiplayer session server for the rhythm game. It
//! accepts TCP connections speaking the `tempolink-shared` wire protocol,
//! authenticates them against an external HTTP identity service, and
//! coordinates rooms through the Selecting → WaitingForReady → Playing
//! cycle. The server is the single source of truth for room state; clients
//! are thin views reacting to broadcast state changes.
//!
//! ## Module Organization
//!
//! - `config`: YAML configuration with create-on-missing defaults.
//! - `identity`: HTTP client for the `/me`, `/chart/{id}` and
//!   `/record/{id}` endpoints.
//! - `connection`: per-socket handshake plus receive/send/heartbeat loops.
//! - `session`: authentication gate and post-auth command dispatch.
//! - `user`: identity-keyed presence records and the dangling grace
//!   mechanism that survives transient disconnects.
//! - `room`: the room state machine, host policy, votes, and broadcast
//!   fan-out.
//! - `server`: listener, registries, and the lost-connection drain.

use std::time::Duration;

pub mod config;
pub mod connection;
pub mod identity;
pub mod room;
pub mod server;
pub mod session;
pub mod user;

/// A connection is dropped once the peer has been silent this long.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the heartbeat watchdog checks for silence.
pub const HEARTBEAT_POLL: Duration = Duration::from_secs(1);

/// How long a user keeps their room membership after losing a connection
/// outside gameplay.
pub const DANGLE_GRACE: Duration = Duration::from_secs(10);
