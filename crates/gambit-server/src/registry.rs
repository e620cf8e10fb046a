//! Session registry and broadcast fan-out.
//!
//! A fixed-capacity slot table of every session admitted during this
//! run. Slots are appended by the accept loop only and never reused;
//! sessions that end stay in their slot with the open flag down, so a
//! broadcast simply skips them. Admission and broadcast iteration are
//! serialized by the table lock, which is never held across an await —
//! delivery goes through each session's outbound channel without
//! blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gambit_core::frame::Frame;
use gambit_core::role::Role;

/// Concurrent sessions allowed in one run of the relay.
pub const DEFAULT_CAPACITY: usize = 10;

/// Outbound frames buffered per session before delivery counts as failed.
pub const OUTBOUND_BUFFER: usize = 64;

/// Admission refusals.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The slot table is full for this run.
    #[error("registry is at capacity ({0} sessions)")]
    AtCapacity(usize),
}

/// The registry's view of one session: immutable identity plus the
/// handle used to reach its writer task.
///
/// The open flag is the session's broadcast liveness; once it drops the
/// handle is inert and delivery attempts become no-ops.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    role: Role,
    open: AtomicBool,
    outbound: mpsc::Sender<Frame>,
}

impl SessionHandle {
    fn new(id: u64, role: Role, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            role,
            open: AtomicBool::new(true),
            outbound,
        }
    }

    /// Connection id, ascending from 1 in admission order.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Seat assigned at admission. Never changes.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this session still participates in dispatch.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Drop the session out of dispatch. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Offer a frame to this session's writer.
    ///
    /// Returns `false` when the outbound channel is full or gone, which
    /// the caller treats as this one session being unreachable.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}

/// Fixed-capacity table of admitted sessions.
pub struct Registry {
    capacity: usize,
    slots: RwLock<Vec<Arc<SessionHandle>>>,
}

impl Registry {
    /// Registry with room for `capacity` sessions per run.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Admit a connection: assign the next id and its seat, and append
    /// the session to the slot table.
    ///
    /// Called from the accept loop only. Ids count all admissions for
    /// the run, so a session that later closes still holds its number.
    pub fn admit(
        &self,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<SessionHandle>, AdmissionError> {
        let mut slots = self.slots.write();
        if slots.len() >= self.capacity {
            return Err(AdmissionError::AtCapacity(self.capacity));
        }

        let id = slots.len() as u64 + 1;
        let role = Role::for_admission(id);
        let handle = Arc::new(SessionHandle::new(id, role, outbound));
        slots.push(Arc::clone(&handle));
        info!(id, role = %role, "session admitted");
        Ok(handle)
    }

    /// Fan a text message out to every open session — including the one
    /// that triggered the broadcast; the sender reconciles its own move
    /// from the echo.
    ///
    /// A session whose channel refuses the frame is marked closed and
    /// skipped from then on; the remaining deliveries proceed.
    pub fn broadcast(&self, text: &str) {
        let payload = Bytes::copy_from_slice(text.as_bytes());
        let slots = self.slots.read();
        let mut recipients = 0u32;
        for session in slots.iter().filter(|session| session.is_open()) {
            if session.send(Frame::text(payload.clone())) {
                recipients += 1;
            } else {
                warn!(id = session.id(), "unreachable session dropped from dispatch");
                session.close();
            }
        }
        debug!(text, recipients, "broadcast");
    }

    /// Total admissions this run, open or not.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.slots.read().len()
    }

    /// Sessions still participating in dispatch.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|session| session.is_open())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use gambit_core::frame::Opcode;

    fn admit_one(registry: &Registry) -> (Arc<SessionHandle>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (registry.admit(tx).unwrap(), rx)
    }

    fn payload_of(frame: &Frame) -> String {
        String::from_utf8_lossy(&frame.payload).into_owned()
    }

    #[test]
    fn admission_order_assigns_white_black_then_spectators() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let roles: Vec<Role> = (0..4).map(|_| admit_one(&registry).0.role()).collect();
        assert_eq!(
            roles,
            [Role::White, Role::Black, Role::Spectator, Role::Spectator]
        );
    }

    #[test]
    fn ids_ascend_from_one() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let ids: Vec<u64> = (0..3).map(|_| admit_one(&registry).0.id()).collect();
        assert_eq!(ids, [1, 2, 3]);
    }

    #[test]
    fn eleventh_admission_is_refused() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let sessions: Vec<_> = (0..10).map(|_| admit_one(&registry)).collect();

        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let err = registry.admit(tx).unwrap_err();
        assert_matches!(err, AdmissionError::AtCapacity(10));

        // The ten admitted sessions are unaffected.
        assert_eq!(registry.admitted(), 10);
        assert!(sessions.iter().all(|(handle, _)| handle.is_open()));
    }

    #[test]
    fn closed_slots_are_not_reused() {
        let registry = Registry::new(2);
        let (first, _rx1) = admit_one(&registry);
        first.close();

        let (second, _rx2) = admit_one(&registry);
        assert_eq!(second.id(), 2);

        // Capacity counts admissions, not open sessions.
        let (tx, _rx3) = mpsc::channel(OUTBOUND_BUFFER);
        assert_matches!(registry.admit(tx), Err(AdmissionError::AtCapacity(2)));
    }

    #[test]
    fn broadcast_reaches_every_open_session_including_sender() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let mut sessions: Vec<_> = (0..3).map(|_| admit_one(&registry)).collect();

        // "Sender" is just one of the admitted sessions; the registry
        // does not special-case it.
        registry.broadcast("e2e4:black");

        for (_, rx) in &mut sessions {
            let frame = rx.try_recv().unwrap();
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(payload_of(&frame), "e2e4:black");
        }
    }

    #[test]
    fn closed_sessions_are_skipped() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let (open, mut open_rx) = admit_one(&registry);
        let (closed, mut closed_rx) = admit_one(&registry);
        closed.close();

        registry.broadcast("d2d4:black");

        assert_eq!(payload_of(&open_rx.try_recv().unwrap()), "d2d4:black");
        assert!(closed_rx.try_recv().is_err());
        assert!(open.is_open());
    }

    #[test]
    fn failed_delivery_closes_only_that_session() {
        let registry = Registry::new(DEFAULT_CAPACITY);

        // A session whose writer never drains: buffer of one, pre-filled.
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        let stuck = registry.admit(stuck_tx).unwrap();
        assert!(stuck.send(Frame::text("backlog")));

        let (healthy, mut healthy_rx) = admit_one(&registry);

        registry.broadcast("g1f3:black");

        assert!(!stuck.is_open(), "undeliverable session must drop out");
        assert!(healthy.is_open());
        assert_eq!(payload_of(&healthy_rx.try_recv().unwrap()), "g1f3:black");
        assert_eq!(registry.open_sessions(), 1);
    }

    #[test]
    fn broadcast_to_empty_registry_is_a_no_op() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        registry.broadcast("e2e4:black");
        assert_eq!(registry.admitted(), 0);
    }

    #[test]
    fn send_on_closed_handle_channel_reports_failure() {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = SessionHandle::new(1, Role::White, tx);
        drop(rx);
        assert!(!handle.send(Frame::text("e2e4")));
    }

    #[test]
    fn close_is_idempotent() {
        let registry = Registry::new(DEFAULT_CAPACITY);
        let (handle, _rx) = admit_one(&registry);
        handle.close();
        handle.close();
        assert!(!handle.is_open());
    }
}
