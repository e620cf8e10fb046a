//! Minimal HTTP/1.1 request-head parsing.
//!
//! Both listeners (the relay's upgrade path and the asset server) speak
//! just enough HTTP to read one request head: the request line plus a
//! header map. Header lookup is case-sensitive by exact name — the
//! contract the upgrade path relies on for `Sec-WebSocket-Key`.

use std::collections::HashMap;
use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a request head before parsing is abandoned.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Request-head errors. Any of these abort the connection that sent the
/// bytes; there is no re-sync with a peer that cannot produce a head.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Transport failure while reading the head.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream before finishing the head.
    #[error("connection closed before the request head completed")]
    UnexpectedEof,
    /// No blank line within [`MAX_HEAD_BYTES`].
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    /// The head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    NotUtf8,
    /// The request line is missing a method, target, or version.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    /// A header line has no colon separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
}

/// A parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    target: String,
    version: String,
    headers: HashMap<String, String>,
}

impl Request {
    /// Parse a request head (request line plus header lines, without the
    /// terminating blank line).
    pub fn parse(head: &str) -> Result<Self, RequestError> {
        let mut lines = head.split("\r\n").filter(|line| !line.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| RequestError::MalformedRequestLine(String::new()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RequestError::MalformedRequestLine(request_line.to_owned()));
        };

        let mut headers = HashMap::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(RequestError::MalformedHeader(line.to_owned()));
            };
            let _ = headers.insert(name.trim().to_owned(), value.trim().to_owned());
        }

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            version: version.to_owned(),
            headers,
        })
    }

    /// HTTP method, e.g. `GET`.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target path, e.g. `/game`.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Protocol version, e.g. `HTTP/1.1`.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-sensitive header lookup by exact name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Read one request head from the stream.
///
/// Returns the parsed head together with any bytes that arrived after
/// the terminating blank line — on the relay path those belong to the
/// frame stream and are handed to the frame decoder.
pub async fn read_request<R>(reader: &mut R) -> Result<(Request, Bytes), RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(head_end) = find_head_end(&buf) {
            let head = buf.split_to(head_end);
            let head = std::str::from_utf8(&head).map_err(|_| RequestError::NotUtf8)?;
            let request = Request::parse(head)?;
            return Ok((request, buf.freeze()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(RequestError::HeadTooLarge);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::UnexpectedEof);
        }
    }
}

/// Offset just past the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
