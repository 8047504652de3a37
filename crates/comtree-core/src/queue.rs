//! # Queue Manager
//!
//! Per-link output queues. Every link owns a default queue plus one queue per
//! comtree that has been given a reserved rate on that link. Queues are
//! served by deficit round robin with a quantum proportional to the queue's
//! reserved rate, and a token-bucket pacer keeps each link at its capacity.
//!
//! Enqueue never blocks. A queue over its packet or byte limit rejects the
//! packet with `QueueFull` and the caller drops it.

use quanta::Instant;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, LinkId};
use crate::pool::{PacketHandle, PacketStore};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Smallest DRR quantum; every backlogged queue can send one full datagram
/// per round.
pub const MTU: usize = 1500;

/// Reserved rate is converted to a quantum by the bytes it would carry in
/// this many milliseconds.
const QUANTUM_INTERVAL_MS: u64 = 20;

/// Pacer burst allowance in milliseconds of link capacity.
const PACER_BURST_MS: u64 = 10;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// Deficit round robin across the link's queues.
    #[default]
    Drr,
    /// Strict arrival order across the link's queues.
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    pub max_packets: usize,
    pub max_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        QueueLimits {
            max_packets: 1000,
            max_bytes: 1_000_000,
        }
    }
}

/// Packets and bytes held.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub packets: usize,
    pub bytes: usize,
}

fn quantum_for(rate_kbps: u32) -> usize {
    let bytes = rate_kbps as u64 * QUANTUM_INTERVAL_MS / 8;
    (bytes as usize).max(MTU)
}

// ─── Pacer ───────────────────────────────────────────────────────────────────

/// Token bucket in bytes. Tokens may go negative by at most one packet so a
/// datagram larger than the remaining balance is still sent once the bucket
/// refills past zero.
#[derive(Debug)]
struct Pacer {
    bytes_per_sec: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl Pacer {
    fn new(capacity_kbps: u32) -> Self {
        let bytes_per_sec = capacity_kbps as f64 * 1000.0 / 8.0;
        let burst = (bytes_per_sec * PACER_BURST_MS as f64 / 1000.0).max(2.0 * MTU as f64);
        Pacer {
            bytes_per_sec,
            burst,
            tokens: burst,
            last: None,
        }
    }

    /// A zero-capacity link is not paced.
    fn unlimited(&self) -> bool {
        self.bytes_per_sec <= 0.0
    }

    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.bytes_per_sec).min(self.burst);
        }
        self.last = Some(now);
    }

    fn ready(&mut self, now: Instant) -> bool {
        if self.unlimited() {
            return true;
        }
        self.refill(now);
        self.tokens > 0.0
    }

    fn consume(&mut self, bytes: usize) {
        if !self.unlimited() {
            self.tokens -= bytes as f64;
        }
    }
}

// ─── Per-Link State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Queued {
    handle: PacketHandle,
    len: usize,
}

/// `None` names the default queue.
type QueueKey = Option<ComtreeId>;

#[derive(Debug)]
struct OutputQueue {
    packets: VecDeque<Queued>,
    bytes: usize,
    quantum: usize,
    deficit: usize,
    in_turn: bool,
    limits: QueueLimits,
}

impl OutputQueue {
    fn new(quantum: usize, limits: QueueLimits) -> Self {
        OutputQueue {
            packets: VecDeque::new(),
            bytes: 0,
            quantum,
            deficit: 0,
            in_turn: false,
            limits,
        }
    }

    fn pop(&mut self) -> Option<Queued> {
        let q = self.packets.pop_front()?;
        self.bytes -= q.len;
        Some(q)
    }
}

#[derive(Debug)]
struct LinkQueues {
    queues: HashMap<QueueKey, OutputQueue>,
    /// Round-robin order; the default queue is always first.
    order: Vec<QueueKey>,
    cursor: usize,
    /// Arrival order, used by the FIFO discipline.
    arrivals: VecDeque<QueueKey>,
    pacer: Pacer,
    total: Occupancy,
}

impl LinkQueues {
    fn new(capacity_kbps: u32, limits: QueueLimits) -> Self {
        let mut queues = HashMap::new();
        queues.insert(None, OutputQueue::new(MTU, limits));
        LinkQueues {
            queues,
            order: vec![None],
            cursor: 0,
            arrivals: VecDeque::new(),
            pacer: Pacer::new(capacity_kbps),
            total: Occupancy::default(),
        }
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.order.len();
    }

    fn take(&mut self, key: QueueKey) -> Option<Queued> {
        let q = self.queues.get_mut(&key)?.pop()?;
        self.total.packets -= 1;
        self.total.bytes -= q.len;
        Some(q)
    }

    fn next_drr(&mut self) -> Option<Queued> {
        if self.total.packets == 0 {
            return None;
        }
        // Every backlogged queue gains a quantum per visit, so some head
        // packet fits after finitely many rounds whatever its length.
        loop {
            let key = self.order[self.cursor];
            let Some(q) = self.queues.get_mut(&key) else {
                self.advance();
                continue;
            };
            let Some(head_len) = q.packets.front().map(|p| p.len) else {
                q.deficit = 0;
                q.in_turn = false;
                self.advance();
                continue;
            };
            if !q.in_turn {
                q.deficit += q.quantum;
                q.in_turn = true;
            }
            if head_len <= q.deficit {
                q.deficit -= head_len;
                let drained = q.packets.len() == 1;
                if drained {
                    q.deficit = 0;
                    q.in_turn = false;
                }
                let out = self.take(key);
                if drained {
                    self.advance();
                }
                return out;
            }
            q.in_turn = false;
            self.advance();
        }
    }

    fn next_fifo(&mut self) -> Option<Queued> {
        while let Some(key) = self.arrivals.pop_front() {
            if let Some(q) = self.take(key) {
                return Some(q);
            }
        }
        None
    }

    fn next(&mut self, discipline: Discipline) -> Option<Queued> {
        match discipline {
            Discipline::Drr => self.next_drr(),
            Discipline::Fifo => self.next_fifo(),
        }
    }

    fn drain_queue(&mut self, key: QueueKey) -> Vec<PacketHandle> {
        let mut out = Vec::new();
        while let Some(q) = self.take(key) {
            out.push(q.handle);
        }
        self.arrivals.retain(|k| *k != key);
        out
    }
}

// ─── Queue Manager ───────────────────────────────────────────────────────────

pub struct QueueManager {
    links: RwLock<HashMap<LinkId, Mutex<LinkQueues>>>,
    discipline: Discipline,
    limits: QueueLimits,
    store: Arc<PacketStore>,
}

impl QueueManager {
    pub fn new(store: Arc<PacketStore>, discipline: Discipline, limits: QueueLimits) -> Self {
        QueueManager {
            links: RwLock::new(HashMap::new()),
            discipline,
            limits,
            store,
        }
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    fn with_link<T>(&self, link: LinkId, f: impl FnOnce(&mut LinkQueues) -> T) -> Result<T> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let lq = links.get(&link).ok_or(RouterError::UnknownLink(link))?;
        let mut guard: MutexGuard<'_, LinkQueues> =
            lq.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Create the queue set for a link, paced at `capacity_kbps`.
    pub fn add_link(&self, link: LinkId, capacity_kbps: u32) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        links
            .entry(link)
            .or_insert_with(|| Mutex::new(LinkQueues::new(capacity_kbps, self.limits)));
    }

    /// Drop a link's queues, releasing every packet still held.
    pub fn remove_link(&self, link: LinkId) -> usize {
        let removed = self
            .links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&link);
        let Some(lq) = removed else {
            return 0;
        };
        let mut lq = lq.into_inner().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<QueueKey> = lq.order.clone();
        let mut dropped = 0;
        for key in keys {
            for handle in lq.drain_queue(key) {
                let _ = self.store.release(handle);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn set_capacity(&self, link: LinkId, capacity_kbps: u32) -> Result<()> {
        self.with_link(link, |lq| lq.pacer = Pacer::new(capacity_kbps))
    }

    /// Create or re-rate the queue for `comtree` on `link`.
    pub fn configure_queue(&self, link: LinkId, comtree: ComtreeId, rate_kbps: u32) -> Result<()> {
        let limits = self.limits;
        self.with_link(link, |lq| {
            let key = Some(comtree);
            let quantum = quantum_for(rate_kbps);
            match lq.queues.get_mut(&key) {
                Some(q) => q.quantum = quantum,
                None => {
                    lq.queues.insert(key, OutputQueue::new(quantum, limits));
                    lq.order.push(key);
                }
            }
        })
    }

    /// Remove the queue for `comtree` on `link`. Packets still queued are
    /// released; the count is returned.
    pub fn remove_queue(&self, link: LinkId, comtree: ComtreeId) -> Result<usize> {
        let handles = self.with_link(link, |lq| {
            let key = Some(comtree);
            if !lq.queues.contains_key(&key) {
                return Vec::new();
            }
            let handles = lq.drain_queue(key);
            lq.queues.remove(&key);
            if let Some(pos) = lq.order.iter().position(|k| *k == key) {
                lq.order.remove(pos);
                if lq.cursor > pos {
                    lq.cursor -= 1;
                }
                if lq.cursor >= lq.order.len() {
                    lq.cursor = 0;
                }
            }
            handles
        })?;
        for &h in &handles {
            let _ = self.store.release(h);
        }
        Ok(handles.len())
    }

    pub fn has_queue(&self, link: LinkId, comtree: ComtreeId) -> bool {
        self.with_link(link, |lq| lq.queues.contains_key(&Some(comtree)))
            .unwrap_or(false)
    }

    /// Queue `handle` on `link`. Comtrees without a configured queue share
    /// the link's default queue.
    pub fn enqueue(
        &self,
        link: LinkId,
        comtree: ComtreeId,
        handle: PacketHandle,
        len: usize,
    ) -> Result<()> {
        self.push(link, comtree, false, handle, len)
    }

    /// Queue signalling traffic on the link's default queue.
    pub fn enqueue_default(
        &self,
        link: LinkId,
        comtree: ComtreeId,
        handle: PacketHandle,
        len: usize,
    ) -> Result<()> {
        self.push(link, comtree, true, handle, len)
    }

    fn push(
        &self,
        link: LinkId,
        comtree: ComtreeId,
        force_default: bool,
        handle: PacketHandle,
        len: usize,
    ) -> Result<()> {
        self.with_link(link, |lq| {
            let key = if !force_default && lq.queues.contains_key(&Some(comtree)) {
                Some(comtree)
            } else {
                None
            };
            let Some(q) = lq.queues.get_mut(&key) else {
                return Err(RouterError::QueueFull { link, comtree });
            };
            if q.packets.len() >= q.limits.max_packets || q.bytes + len > q.limits.max_bytes {
                debug!(link = %link, comtree = %comtree, "queue full, dropping");
                return Err(RouterError::QueueFull { link, comtree });
            }
            q.packets.push_back(Queued { handle, len });
            q.bytes += len;
            lq.total.packets += 1;
            lq.total.bytes += len;
            if self.discipline == Discipline::Fifo {
                lq.arrivals.push_back(key);
            }
            Ok(())
        })?
    }

    /// Next packet for `link` by the scheduling discipline, ignoring pacing.
    pub fn dequeue(&self, link: LinkId) -> Option<PacketHandle> {
        let discipline = self.discipline;
        self.with_link(link, |lq| lq.next(discipline).map(|q| q.handle))
            .ok()
            .flatten()
    }

    /// Next packet for `link` if the pacer has tokens at `now`.
    pub fn dequeue_ready(&self, link: LinkId, now: Instant) -> Option<PacketHandle> {
        let discipline = self.discipline;
        self.with_link(link, |lq| {
            if lq.total.packets == 0 || !lq.pacer.ready(now) {
                return None;
            }
            let q = lq.next(discipline)?;
            lq.pacer.consume(q.len);
            Some(q.handle)
        })
        .ok()
        .flatten()
    }

    pub fn occupancy(&self, link: LinkId) -> Result<Occupancy> {
        self.with_link(link, |lq| lq.total)
    }

    /// Occupancy of the queue serving `comtree` on `link` (the default queue
    /// when the comtree has none).
    pub fn queue_occupancy(&self, link: LinkId, comtree: ComtreeId) -> Result<Occupancy> {
        self.with_link(link, |lq| {
            let q = lq
                .queues
                .get(&Some(comtree))
                .or_else(|| lq.queues.get(&None));
            q.map(|q| Occupancy {
                packets: q.packets.len(),
                bytes: q.bytes,
            })
            .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FlatAddr;
    use crate::wire::{PacketHeader, PacketType};
    use bytes::Bytes;
    use std::time::Duration;

    const L1: LinkId = LinkId(1);

    fn setup(discipline: Discipline, limits: QueueLimits) -> (Arc<PacketStore>, QueueManager) {
        let store = Arc::new(PacketStore::new(1024));
        let qm = QueueManager::new(store.clone(), discipline, limits);
        qm.add_link(L1, 0);
        (store, qm)
    }

    fn packet(store: &PacketStore, comtree: u32) -> PacketHandle {
        let hdr = PacketHeader::new(
            PacketType::Data,
            ComtreeId(comtree),
            FlatAddr::new(1, 1),
            FlatAddr::new(1, 2),
            0,
        );
        store.allocate(hdr, None, Bytes::new()).unwrap()
    }

    #[test]
    fn over_limit_enqueue_rejected() {
        let limits = QueueLimits {
            max_packets: 2,
            max_bytes: 10_000,
        };
        let (store, qm) = setup(Discipline::Drr, limits);
        for _ in 0..2 {
            qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 100).unwrap();
        }
        let err = qm
            .enqueue(L1, ComtreeId(1), packet(&store, 1), 100)
            .unwrap_err();
        assert!(err.is_resource_exhausted());
        assert_eq!(qm.occupancy(L1).unwrap().packets, 2);
    }

    #[test]
    fn byte_limit_enforced() {
        let limits = QueueLimits {
            max_packets: 100,
            max_bytes: 250,
        };
        let (store, qm) = setup(Discipline::Drr, limits);
        qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 200).unwrap();
        assert!(qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 100).is_err());
        qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 50).unwrap();
        assert_eq!(qm.occupancy(L1).unwrap().bytes, 250);
    }

    #[test]
    fn unknown_link_is_reported() {
        let (store, qm) = setup(Discipline::Drr, QueueLimits::default());
        let h = packet(&store, 1);
        assert_eq!(
            qm.enqueue(LinkId(9), ComtreeId(1), h, 10),
            Err(RouterError::UnknownLink(LinkId(9)))
        );
        assert!(qm.dequeue(LinkId(9)).is_none());
    }

    #[test]
    fn drr_shares_in_proportion_to_rate() {
        let (store, qm) = setup(Discipline::Drr, QueueLimits::default());
        // 1200 kb/s -> 3000 byte quantum, 600 kb/s -> 1500 byte quantum
        qm.configure_queue(L1, ComtreeId(1), 1200).unwrap();
        qm.configure_queue(L1, ComtreeId(2), 600).unwrap();
        for _ in 0..30 {
            qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 500).unwrap();
            qm.enqueue(L1, ComtreeId(2), packet(&store, 2), 500).unwrap();
        }
        let mut counts = [0usize; 3];
        for _ in 0..18 {
            let h = qm.dequeue(L1).unwrap();
            counts[store.header(h).unwrap().comtree.0 as usize] += 1;
        }
        assert_eq!(counts[1], 12);
        assert_eq!(counts[2], 6);
    }

    #[test]
    fn packet_longer_than_several_quanta_is_still_served() {
        let (store, qm) = setup(Discipline::Drr, QueueLimits::default());
        qm.configure_queue(L1, ComtreeId(1), 0).unwrap();
        let big = packet(&store, 1);
        qm.enqueue(L1, ComtreeId(1), big, 6 * MTU).unwrap();
        assert_eq!(qm.dequeue(L1), Some(big));
        assert!(qm.dequeue(L1).is_none());

        // a large head does not hold back the other queues
        let big = packet(&store, 1);
        let small = packet(&store, 2);
        qm.enqueue(L1, ComtreeId(1), big, 5 * MTU).unwrap();
        qm.enqueue(L1, ComtreeId(2), small, 100).unwrap();
        let first = qm.dequeue(L1).unwrap();
        let second = qm.dequeue(L1).unwrap();
        assert_eq!((first, second), (small, big));
        assert_eq!(qm.occupancy(L1).unwrap(), Occupancy::default());
    }

    #[test]
    fn unconfigured_comtree_uses_default_queue() {
        let (store, qm) = setup(Discipline::Drr, QueueLimits::default());
        qm.enqueue(L1, ComtreeId(7), packet(&store, 7), 100).unwrap();
        assert!(!qm.has_queue(L1, ComtreeId(7)));
        assert_eq!(qm.queue_occupancy(L1, ComtreeId(7)).unwrap().packets, 1);
        assert!(qm.dequeue(L1).is_some());
        assert!(qm.dequeue(L1).is_none());
    }

    #[test]
    fn fifo_preserves_arrival_order() {
        let (store, qm) = setup(Discipline::Fifo, QueueLimits::default());
        qm.configure_queue(L1, ComtreeId(1), 100).unwrap();
        let a = packet(&store, 1);
        let b = packet(&store, 2);
        let c = packet(&store, 1);
        qm.enqueue(L1, ComtreeId(1), a, 10).unwrap();
        qm.enqueue(L1, ComtreeId(2), b, 10).unwrap();
        qm.enqueue(L1, ComtreeId(1), c, 10).unwrap();
        assert_eq!(qm.dequeue(L1), Some(a));
        assert_eq!(qm.dequeue(L1), Some(b));
        assert_eq!(qm.dequeue(L1), Some(c));
    }

    #[test]
    fn remove_queue_releases_packets() {
        let (store, qm) = setup(Discipline::Drr, QueueLimits::default());
        qm.configure_queue(L1, ComtreeId(3), 100).unwrap();
        for _ in 0..4 {
            qm.enqueue(L1, ComtreeId(3), packet(&store, 3), 10).unwrap();
        }
        assert_eq!(qm.remove_queue(L1, ComtreeId(3)).unwrap(), 4);
        assert_eq!(store.in_use(), 0);
        assert_eq!(qm.occupancy(L1).unwrap(), Occupancy::default());
        assert!(qm.dequeue(L1).is_none());
    }

    #[test]
    fn pacer_limits_to_capacity() {
        let store = Arc::new(PacketStore::new(64));
        let qm = QueueManager::new(store.clone(), Discipline::Drr, QueueLimits::default());
        // 1200 kb/s = 150 bytes/ms, burst = 3000 bytes
        qm.add_link(L1, 1200);
        for _ in 0..10 {
            qm.enqueue(L1, ComtreeId(1), packet(&store, 1), 1500).unwrap();
        }
        let t0 = Instant::now();
        let mut sent = 0;
        while qm.dequeue_ready(L1, t0).is_some() {
            sent += 1;
        }
        assert_eq!(sent, 2);
        // 20 ms later another 3000 bytes of credit (capped at burst)
        let t1 = t0 + Duration::from_millis(20);
        while qm.dequeue_ready(L1, t1).is_some() {
            sent += 1;
        }
        assert_eq!(sent, 4);
    }
}
