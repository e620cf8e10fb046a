//! Static asset listener for the game client.
//!
//! A deliberately small HTTP file server, independent of the relay and
//! sharing no state with it: `/` maps to the chessboard page, anything
//! else resolves under the web root, and the content type comes from
//! the file extension. One request per connection, then close.

use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gambit_core::http::{RequestError, read_request};

use crate::config::ServerConfig;

/// Page served for `/`.
const INDEX_PAGE: &str = "chessboard.html";

/// The asset server's TCP listener.
pub struct AssetListener {
    listener: TcpListener,
    root: PathBuf,
}

impl AssetListener {
    /// Bind the asset port from the configuration.
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.assets_port)).await?;
        Ok(Self {
            listener,
            root: config.web_root.clone(),
        })
    }

    /// The bound address (useful when the port was auto-assigned).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the shutdown token fires, serving each connection
    /// on its own task.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, root = %self.root.display(), "asset server listening"),
            Err(error) => warn!(%error, "asset server listening on unknown address"),
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "asset connection accepted");
                        let _ = tokio::spawn(serve_connection(stream, self.root.clone()));
                    }
                    Err(error) => warn!(%error, "failed to accept asset connection"),
                }
            }
        }

        info!("asset server stopped");
    }
}

/// Serve one request, then shut the stream down.
async fn serve_connection<S>(mut stream: S, root: PathBuf)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match handle_request(&mut stream, &root).await {
        Ok(status) => debug!(status, "asset request served"),
        Err(error) => debug!(%error, "asset request failed"),
    }
    let _ = stream.shutdown().await;
}

async fn handle_request<S>(stream: &mut S, root: &Path) -> Result<u16, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, _leftover) = read_request(stream).await?;

    if request.method() != "GET" {
        write_response(stream, 405, "Method Not Allowed", None, b"").await?;
        return Ok(405);
    }

    let Some(path) = resolve(root, request.target()) else {
        write_response(stream, 404, "Not Found", None, b"").await?;
        return Ok(404);
    };

    match tokio::fs::read(&path).await {
        Ok(body) => {
            write_response(stream, 200, "OK", Some(content_type(&path)), &body).await?;
            Ok(200)
        }
        Err(error) => {
            debug!(path = %path.display(), %error, "asset not readable");
            write_response(stream, 404, "Not Found", None, b"").await?;
            Ok(404)
        }
    }
}

/// Map a request target onto a file under the root.
///
/// `/` serves the board page. Targets that try to step outside the root
/// (anything but plain path segments) resolve to nothing.
fn resolve(root: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or(target);
    let relative = if path == "/" {
        INDEX_PAGE
    } else {
        path.trim_start_matches('/')
    };

    let relative = Path::new(relative);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

/// Content type from the file extension.
fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n");
    if let Some(kind) = content_type {
        head.push_str(&format!("Content-Type: {kind}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
