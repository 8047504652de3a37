//! # Pending Control Requests
//!
//! Tracks control requests that expect a reply: retransmits on timeout up to
//! an attempt budget, then gives up.
//!
//! ```text
//!   Sent ──▶ AwaitingReply ──▶ Acknowledged
//!                 │   ▲
//!          timeout│   │retransmit
//!                 ▼   │
//!              RetrySent ──(budget spent)──▶ Failed
//! ```
//!
//! A reply and a timeout can race on the same request. Each side moves the
//! request's atomic state with compare-and-swap; only the side whose swap
//! lands into a terminal state acts on the outcome.

use quanta::Instant;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ids::LinkId;
use crate::wire::Packet;

/// Default reply timeout per attempt.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of transmissions, the first one included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Sent = 0,
    AwaitingReply = 1,
    RetrySent = 2,
    Acknowledged = 3,
    Failed = 4,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Sent,
            1 => RequestState::AwaitingReply,
            2 => RequestState::RetrySent,
            3 => RequestState::Acknowledged,
            _ => RequestState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Acknowledged | RequestState::Failed)
    }
}

// ─── Pending Request ─────────────────────────────────────────────────────────

/// An outstanding request. `C` is whatever the sender needs to finish the
/// operation once the outcome is known.
pub struct PendingRequest<C> {
    seq: u64,
    link: LinkId,
    packet: Packet,
    state: AtomicU8,
    attempts: AtomicU32,
    deadline: Mutex<Instant>,
    context: Mutex<C>,
}

impl<C> PendingRequest<C> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Link the request was sent on.
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transmissions so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn context(&self) -> MutexGuard<'_, C> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to a terminal state from whatever live state the request is in.
    /// Returns false if another party already finished it.
    fn finish(&self, to: RequestState) -> bool {
        loop {
            let current = self.state();
            if current.is_terminal() {
                return false;
            }
            if self.transition(current, to) {
                return true;
            }
        }
    }

    /// First transmission went out.
    pub fn mark_sent(&self) -> bool {
        self.transition(RequestState::Sent, RequestState::AwaitingReply)
    }
}

impl<C> std::fmt::Debug for PendingRequest<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("seq", &self.seq)
            .field("link", &self.link)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

// ─── Timer Outcomes ──────────────────────────────────────────────────────────

pub enum TimerAction<C> {
    /// Send the request again.
    Retransmit(Arc<PendingRequest<C>>),
    /// Attempt budget spent; the request is gone from the table.
    Failed(Arc<PendingRequest<C>>),
}

// ─── Pending Table ───────────────────────────────────────────────────────────

pub struct PendingTable<C> {
    entries: Mutex<HashMap<u64, Arc<PendingRequest<C>>>>,
    next_seq: AtomicU64,
    timeout: Duration,
    max_attempts: u32,
}

impl<C> PendingTable<C> {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        PendingTable {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(rand::random::<u32>() as u64 + 1),
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<PendingRequest<C>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh sequence number for an outgoing request.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Track a request about to be sent on `link`.
    pub fn register(
        &self,
        seq: u64,
        link: LinkId,
        packet: Packet,
        context: C,
        now: Instant,
    ) -> Arc<PendingRequest<C>> {
        let req = Arc::new(PendingRequest {
            seq,
            link,
            packet,
            state: AtomicU8::new(RequestState::Sent as u8),
            attempts: AtomicU32::new(1),
            deadline: Mutex::new(now + self.timeout),
            context: Mutex::new(context),
        });
        self.lock().insert(seq, req.clone());
        req
    }

    pub fn get(&self, seq: u64) -> Option<Arc<PendingRequest<C>>> {
        self.lock().get(&seq).cloned()
    }

    /// Match a reply. Returns the request only if this call won it.
    pub fn complete(&self, seq: u64) -> Option<Arc<PendingRequest<C>>> {
        let req = self.get(seq)?;
        if !req.finish(RequestState::Acknowledged) {
            return None;
        }
        self.lock().remove(&seq);
        Some(req)
    }

    /// Drop a request without reporting an outcome.
    pub fn cancel(&self, seq: u64) -> Option<Arc<PendingRequest<C>>> {
        let req = self.get(seq)?;
        if !req.finish(RequestState::Failed) {
            return None;
        }
        self.lock().remove(&seq);
        Some(req)
    }

    /// Expire overdue requests: retransmit those with attempts left, fail
    /// the rest.
    pub fn poll_timeouts(&self, now: Instant) -> Vec<TimerAction<C>> {
        let due: Vec<Arc<PendingRequest<C>>> = self
            .lock()
            .values()
            .filter(|r| r.deadline() <= now)
            .cloned()
            .collect();

        let mut actions = Vec::with_capacity(due.len());
        for req in due {
            let current = req.state();
            if current.is_terminal() {
                continue;
            }
            if req.attempts() < self.max_attempts {
                if req.transition(current, RequestState::RetrySent) {
                    req.attempts.fetch_add(1, Ordering::AcqRel);
                    *req.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
                        now + self.timeout;
                    actions.push(TimerAction::Retransmit(req));
                }
            } else if req.transition(current, RequestState::Failed) {
                self.lock().remove(&req.seq);
                actions.push(TimerAction::Failed(req));
            }
        }
        actions
    }

    /// Earliest deadline among live requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|r| r.deadline()).min()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
