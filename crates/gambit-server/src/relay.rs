//! WebSocket accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::registry::{OUTBOUND_BUFFER, Registry};
use crate::session;

/// The relay's TCP listener: accepts connections, admits them through
/// the registry, and hands each one to its own session driver task.
pub struct RelayListener {
    listener: TcpListener,
    registry: Arc<Registry>,
    max_frame_bytes: usize,
}

impl RelayListener {
    /// Bind the relay port from the configuration.
    pub async fn bind(config: &ServerConfig, registry: Arc<Registry>) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.relay_port)).await?;
        Ok(Self {
            listener,
            registry,
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    /// The bound address (useful when the port was auto-assigned).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the shutdown token fires.
    ///
    /// Every per-connection failure — refused admission, accept error —
    /// is logged and the loop keeps accepting; one peer never takes the
    /// listener down with it.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "relay listening"),
            Err(error) => warn!(%error, "relay listening on unknown address"),
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
                        match self.registry.admit(tx) {
                            Ok(handle) => {
                                debug!(%peer, id = handle.id(), "connection accepted");
                                let _ = tokio::spawn(session::drive(
                                    stream,
                                    handle,
                                    Arc::clone(&self.registry),
                                    rx,
                                    self.max_frame_bytes,
                                    shutdown.child_token(),
                                ));
                            }
                            Err(error) => {
                                warn!(%peer, %error, "admission refused; dropping connection");
                            }
                        }
                    }
                    Err(error) => warn!(%error, "failed to accept connection"),
                }
            }
        }

        info!("relay listener stopped");
    }
}
