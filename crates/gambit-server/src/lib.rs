//! # gambit-server
//!
//! The chessboard relay itself, wired from the vocabulary in
//! `gambit-core`:
//!
//! - [`registry`] — fixed-capacity session table and broadcast fan-out
//! - [`session`] — per-connection lifecycle state machine and I/O driver
//! - [`relay`] — the WebSocket accept loop
//! - [`assets`] — the static asset HTTP listener for the game client
//! - [`config`] — server configuration
//! - [`shutdown`] — cancellation-token shutdown coordination
//!
//! ## Data Flow
//!
//! `relay` accepts → `registry` admits (id + seat) → `session` drives the
//! handshake and receive loop → moves fan out through `registry` to every
//! open session, the sender included.

#![deny(unsafe_code)]

pub mod assets;
pub mod config;
pub mod registry;
pub mod relay;
pub mod session;
pub mod shutdown;

/// Request path a connection must target to be upgraded into the game.
pub const GAME_ENDPOINT: &str = "/game";
