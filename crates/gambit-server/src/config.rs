//! Server configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_CAPACITY;
use gambit_core::frame::FrameCodec;

/// Configuration for both gambit listeners.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Relay (WebSocket) port (default `4220`; `0` for auto-assign).
    pub relay_port: u16,
    /// Static asset port (default `4221`; `0` for auto-assign).
    pub assets_port: u16,
    /// Directory the asset listener serves files from.
    pub web_root: PathBuf,
    /// Maximum concurrent sessions for one run of the relay.
    pub capacity: usize,
    /// Maximum WebSocket frame payload in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            relay_port: 4220,
            assets_port: 4221,
            web_root: PathBuf::from("web"),
            capacity: DEFAULT_CAPACITY,
            max_frame_bytes: FrameCodec::DEFAULT_MAX_PAYLOAD,
        }
    }
}
