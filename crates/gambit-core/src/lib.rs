//! # gambit-core
//!
//! Wire-protocol vocabulary for the gambit chessboard relay.
//!
//! This crate holds everything the relay needs to speak RFC 6455 (the
//! subset the game uses) without pulling in a protocol library:
//!
//! - **Frames**: [`frame::Frame`], [`frame::Opcode`], and
//!   [`frame::FrameCodec`] — binary encode/decode of WebSocket frames,
//!   including extended payload lengths and client-side masking
//! - **Handshake**: [`handshake::accept_key`] and the HTTP 101 upgrade
//!   exchange (RFC 6455 Section 4)
//! - **Requests**: [`http::Request`] — a minimal HTTP request head with
//!   the case-sensitive header lookup the upgrade path relies on
//! - **Roles**: [`role::Role`] — white/black/spectator seat assignment
//!
//! ## Crate Position
//!
//! Foundation crate. No sockets are opened here; the server crate wires
//! these pieces to real connections.

#![deny(unsafe_code)]

pub mod frame;
pub mod handshake;
pub mod http;
pub mod role;
