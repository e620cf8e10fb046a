//! Per-connection session: lifecycle state machine and I/O driver.
//!
//! The protocol behavior lives in [`Session`], a pure state machine
//! driven one frame at a time — feed it frames, get [`Step`]s back — so
//! the whole dispatch table is testable without a socket. [`drive`] is
//! the async shell around it: it negotiates the upgrade, splits the
//! stream into a framed reader and a writer task, and turns each `Step`
//! into channel sends or registry broadcasts.
//!
//! All socket writes for one session, broadcasts included, funnel
//! through that single writer task; frames leave in enqueue order and
//! never interleave on the wire.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bytes::Bytes;
use gambit_core::frame::{CloseCode, Frame, FrameCodec, FrameError, Opcode};
use gambit_core::handshake::{HandshakeError, accept_key, switching_protocols, upgrade_key};
use gambit_core::http::{RequestError, read_request};
use gambit_core::role::Role;

use crate::GAME_ENDPOINT;
use crate::registry::{Registry, SessionHandle};

/// Connection lifecycle. Transitioned only by the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Reading the upgrade request; nothing framed yet.
    Connecting,
    /// Upgraded; frames flow.
    Open,
    /// Close reply is on its way out; no further dispatch.
    Closing,
    /// Stream released; the session is inert.
    Closed,
}

/// What the driver should do with the frame just dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing.
    Idle,
    /// Queue a reply to this peer only.
    Send(Frame),
    /// Fan the text out through the registry.
    Broadcast(String),
    /// Queue a final reply, then stop reading.
    SendThenClose(Frame),
}

/// Pure per-session protocol state: immutable identity plus the
/// lifecycle the receive loop walks.
pub struct Session {
    id: u64,
    role: Role,
    state: Lifecycle,
}

impl Session {
    /// Fresh session in `Connecting`.
    #[must_use]
    pub fn new(id: u64, role: Role) -> Self {
        Self {
            id,
            role,
            state: Lifecycle::Connecting,
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Seat assigned at admission.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Handshake done: start dispatching frames.
    pub fn opened(&mut self) {
        self.state = Lifecycle::Open;
    }

    /// The close reply was handed to the writer; the session is done.
    pub fn finish_close(&mut self) {
        self.state = Lifecycle::Closed;
    }

    /// Tear down without the closing exchange (transport loss, shutdown,
    /// failed handshake).
    pub fn abort(&mut self) {
        self.state = Lifecycle::Closed;
    }

    /// Dispatch one decoded frame.
    pub fn on_frame(&mut self, frame: &Frame) -> Step {
        if self.state != Lifecycle::Open {
            return Step::Idle;
        }
        match frame.opcode {
            Opcode::Ping => Step::Send(Frame::pong()),
            Opcode::Close => {
                self.state = Lifecycle::Closing;
                Step::SendThenClose(Frame::close(CloseCode::Normal, None))
            }
            Opcode::Unknown(_) => {
                self.state = Lifecycle::Closing;
                Step::SendThenClose(Frame::close(CloseCode::ProtocolError, None))
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation | Opcode::Pong => {
                if frame.payload.is_empty() {
                    return Step::Idle;
                }
                // Spectators consume broadcasts but never produce one.
                match self.role.opponent_label() {
                    Some(next) => Step::Broadcast(format!(
                        "{}:{next}",
                        String::from_utf8_lossy(&frame.payload)
                    )),
                    None => Step::Idle,
                }
            }
        }
    }
}

/// Why a connection never reached `Open`.
#[derive(Debug, Error)]
enum SetupError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Refused(#[from] HandshakeError),
    #[error("failed to write the upgrade response: {0}")]
    Io(#[from] io::Error),
}

/// Read the upgrade request and answer with the 101 response.
///
/// Returns any bytes that followed the request head — they belong to
/// the frame stream.
async fn negotiate(stream: &mut TcpStream) -> Result<Bytes, SetupError> {
    let (request, leftover) = read_request(stream).await?;
    let key = upgrade_key(&request, GAME_ENDPOINT)?;
    let response = switching_protocols(&accept_key(key));
    stream.write_all(response.as_bytes()).await?;
    Ok(leftover)
}

/// Run one connection to completion.
///
/// Owns the socket for the session's whole life. Teardown is
/// deterministic: whatever path exits the loop, the handle is closed,
/// the writer task is signalled and joined, and queued replies are
/// flushed before the stream drops.
pub async fn drive(
    mut stream: TcpStream,
    handle: Arc<SessionHandle>,
    registry: Arc<Registry>,
    outbound: mpsc::Receiver<Frame>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
) {
    let id = handle.id();
    let mut session = Session::new(id, handle.role());

    let leftover = match negotiate(&mut stream).await {
        Ok(leftover) => leftover,
        Err(error) => {
            warn!(id, %error, "upgrade refused; dropping connection");
            handle.close();
            session.abort();
            return;
        }
    };
    session.opened();
    info!(id, role = %handle.role(), "session open");

    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::with_limit(max_frame_bytes));
    frames.read_buffer_mut().extend_from_slice(&leftover);

    let stop = CancellationToken::new();
    let writer = tokio::spawn(write_outbound(
        write_half,
        outbound,
        Arc::clone(&handle),
        stop.clone(),
    ));

    let _ = handle.send(Frame::text(format!("role:{}", handle.role().label())));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = handle.send(Frame::close(CloseCode::GoingAway, None));
                session.abort();
                break;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    match session.on_frame(&frame) {
                        Step::Idle => {}
                        Step::Send(reply) => {
                            let _ = handle.send(reply);
                        }
                        Step::Broadcast(text) => registry.broadcast(&text),
                        Step::SendThenClose(reply) => {
                            if let Opcode::Unknown(code) = frame.opcode {
                                warn!(id, code, "unsupported opcode; answering with protocol error");
                            }
                            let _ = handle.send(reply);
                            session.finish_close();
                            break;
                        }
                    }
                }
                Some(Err(FrameError::Io(error))) => {
                    warn!(id, %error, "transport error; closing session");
                    session.abort();
                    break;
                }
                Some(Err(error)) => {
                    warn!(id, %error, "protocol error; closing session");
                    let _ = handle.send(Frame::close(CloseCode::ProtocolError, None));
                    session.abort();
                    break;
                }
                None => {
                    debug!(id, "peer disconnected");
                    session.abort();
                    break;
                }
            }
        }
    }

    handle.close();
    stop.cancel();
    let _ = writer.await;
    debug!(id, "session torn down");
}

/// Single writer for one session's socket.
///
/// Drains the outbound channel into the framed sink until the channel
/// ends or the stop token fires, then flushes anything enqueued before
/// the signal — the close reply in particular.
async fn write_outbound(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    handle: Arc<SessionHandle>,
    stop: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            biased;
            maybe = outbound.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            () = stop.cancelled() => break,
        };
        if let Err(error) = sink.send(frame).await {
            warn!(id = handle.id(), %error, "write failed; marking session closed");
            handle.close();
            return;
        }
    }
    while let Ok(frame) = outbound.try_recv() {
        if sink.send(frame).await.is_err() {
            handle.close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn open_session(role: Role) -> Session {
        let mut session = Session::new(1, role);
        session.opened();
        session
    }

    fn text_frame(payload: &str) -> Frame {
        Frame::text(payload.as_bytes().to_vec())
    }

    #[test]
    fn starts_connecting_and_opens() {
        let mut session = Session::new(7, Role::Spectator);
        assert_eq!(session.state(), Lifecycle::Connecting);
        assert_eq!(session.id(), 7);
        session.opened();
        assert_eq!(session.state(), Lifecycle::Open);
    }

    #[test]
    fn ping_gets_one_pong_and_stays_open() {
        let mut session = open_session(Role::White);
        let step = session.on_frame(&Frame::ping());
        assert_eq!(step, Step::Send(Frame::pong()));
        assert_eq!(session.state(), Lifecycle::Open);
    }

    #[test]
    fn close_is_echoed_with_normal_status() {
        let mut session = open_session(Role::Black);
        let step = session.on_frame(&Frame::close(CloseCode::Normal, None));
        let Step::SendThenClose(reply) = step else {
            panic!("close must produce a closing reply");
        };
        assert_eq!(reply.opcode, Opcode::Close);
        assert_eq!(reply.close_status(), Some(1000));
        assert_eq!(session.state(), Lifecycle::Closing);

        session.finish_close();
        assert_eq!(session.state(), Lifecycle::Closed);
    }

    #[test]
    fn unknown_opcode_is_answered_with_protocol_error() {
        let mut session = open_session(Role::White);
        let rogue = Frame {
            opcode: Opcode::Unknown(0x5),
            ..Frame::text(Bytes::new())
        };
        let Step::SendThenClose(reply) = session.on_frame(&rogue) else {
            panic!("unknown opcode must close the session");
        };
        assert_eq!(reply.close_status(), Some(1002));
        assert_eq!(session.state(), Lifecycle::Closing);
    }

    #[test]
    fn white_moves_are_labeled_for_black() {
        let mut session = open_session(Role::White);
        let step = session.on_frame(&text_frame("e2e4"));
        assert_eq!(step, Step::Broadcast("e2e4:black".into()));
    }

    #[test]
    fn black_moves_are_labeled_for_white() {
        let mut session = open_session(Role::Black);
        let step = session.on_frame(&text_frame("e7e5"));
        assert_eq!(step, Step::Broadcast("e7e5:white".into()));
    }

    #[test]
    fn spectator_messages_are_inert() {
        let mut session = open_session(Role::Spectator);
        let step = session.on_frame(&text_frame("e2e4"));
        assert_eq!(step, Step::Idle);
        assert_eq!(session.state(), Lifecycle::Open);
    }

    #[test]
    fn empty_payloads_are_ignored() {
        let mut session = open_session(Role::White);
        assert_eq!(session.on_frame(&text_frame("")), Step::Idle);
    }

    #[test]
    fn pong_payload_is_dispatched_like_text() {
        // Pong payloads carry game text just like data frames.
        let mut session = open_session(Role::Black);
        let frame = Frame {
            opcode: Opcode::Pong,
            ..Frame::text("g8f6")
        };
        assert_eq!(session.on_frame(&frame), Step::Broadcast("g8f6:white".into()));
    }

    #[test]
    fn frames_after_close_are_not_dispatched() {
        let mut session = open_session(Role::White);
        let _ = session.on_frame(&Frame::close(CloseCode::Normal, None));
        session.finish_close();
        assert_eq!(session.on_frame(&text_frame("e2e4")), Step::Idle);
    }

    #[test]
    fn aborted_session_is_closed() {
        let mut session = Session::new(1, Role::White);
        session.abort();
        assert_eq!(session.state(), Lifecycle::Closed);
        assert_eq!(session.on_frame(&Frame::ping()), Step::Idle);
    }
}
