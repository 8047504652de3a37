//! # Router Statistics
//!
//! Counters shared by the forwarding path and the control engine. Every
//! component receives the same `Arc<RouterStats>`; counters are relaxed
//! atomics, so recording never takes a lock on the hot path except the
//! first time a link is seen.
//!
//! [`RouterStats::snapshot`] produces a serializable copy for logging and
//! JSON export.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Resource, RouterError};
use crate::ids::LinkId;

// ─── Drop Reasons ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnknownComtree,
    NotMember,
    QueueFull,
    PoolExhausted,
    ControlQueueFull,
    NoRoute,
    /// Datagram from an endpoint that belongs to no link.
    UnknownPeer,
    /// Client link sent a packet clients may not send: a source other than
    /// its own address, network signalling, a route reply, or signalling on
    /// a reserved comtree.
    Untrusted,
}

impl DropReason {
    /// Drop reason for a forwarding-path error, if the error is a drop.
    pub fn for_error(err: &RouterError) -> Option<Self> {
        Some(match err {
            RouterError::Protocol(_) => DropReason::Malformed,
            RouterError::UnknownComtree(_) => DropReason::UnknownComtree,
            RouterError::InvalidTopology(_) => DropReason::NotMember,
            RouterError::QueueFull { .. } => DropReason::QueueFull,
            RouterError::ResourceExhausted(Resource::PacketPool) => DropReason::PoolExhausted,
            RouterError::ResourceExhausted(_) => DropReason::ControlQueueFull,
            RouterError::UnknownLink(_) => DropReason::NoRoute,
            _ => return None,
        })
    }
}

// ─── Per-Link Counters ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LinkCounters {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub link: LinkId,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
}

// ─── Router Stats ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RouterStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    transmitted: AtomicU64,
    control_handled: AtomicU64,

    drop_malformed: AtomicU64,
    drop_unknown_comtree: AtomicU64,
    drop_not_member: AtomicU64,
    drop_queue_full: AtomicU64,
    drop_pool_exhausted: AtomicU64,
    drop_control_queue_full: AtomicU64,
    drop_no_route: AtomicU64,
    drop_unknown_peer: AtomicU64,
    drop_untrusted: AtomicU64,

    protocol_errors: AtomicU64,
    admission_denials: AtomicU64,
    topology_errors: AtomicU64,
    retransmissions: AtomicU64,
    requests_failed: AtomicU64,
    unmatched_replies: AtomicU64,

    links: RwLock<HashMap<LinkId, Arc<LinkCounters>>>,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, link: LinkId) -> Arc<LinkCounters> {
        if let Some(c) = self
            .links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&link)
        {
            return c.clone();
        }
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(link)
            .or_default()
            .clone()
    }

    pub fn record_received(&self, link: LinkId, bytes: usize) {
        bump(&self.received);
        let c = self.link(link);
        bump(&c.packets_in);
        c.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// One packet handed to at least one egress queue.
    pub fn record_forwarded(&self) {
        bump(&self.forwarded);
    }

    pub fn record_transmitted(&self, link: LinkId, bytes: usize) {
        bump(&self.transmitted);
        let c = self.link(link);
        bump(&c.packets_out);
        c.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_control(&self) {
        bump(&self.control_handled);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let c = match reason {
            DropReason::Malformed => &self.drop_malformed,
            DropReason::UnknownComtree => &self.drop_unknown_comtree,
            DropReason::NotMember => &self.drop_not_member,
            DropReason::QueueFull => &self.drop_queue_full,
            DropReason::PoolExhausted => &self.drop_pool_exhausted,
            DropReason::ControlQueueFull => &self.drop_control_queue_full,
            DropReason::NoRoute => &self.drop_no_route,
            DropReason::UnknownPeer => &self.drop_unknown_peer,
            DropReason::Untrusted => &self.drop_untrusted,
        };
        bump(c);
    }

    /// Count a control-handler failure by its error class.
    pub fn record_error(&self, err: &RouterError) {
        match err {
            RouterError::Protocol(_) => bump(&self.protocol_errors),
            RouterError::AdmissionDenied { .. } => bump(&self.admission_denials),
            RouterError::InvalidTopology(_)
            | RouterError::UnknownComtree(_)
            | RouterError::UnknownLink(_)
            | RouterError::UnknownRoute { .. }
            | RouterError::LinkInUse(_)
            | RouterError::Duplicate(_) => bump(&self.topology_errors),
            RouterError::Timeout => bump(&self.requests_failed),
            _ => {}
        }
    }

    pub fn record_protocol_error(&self) {
        bump(&self.protocol_errors);
    }

    pub fn record_retransmission(&self) {
        bump(&self.retransmissions);
    }

    pub fn record_unmatched_reply(&self) {
        bump(&self.unmatched_replies);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut links: Vec<LinkStatsSnapshot> = self
            .links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, c)| LinkStatsSnapshot {
                link: *id,
                packets_in: get(&c.packets_in),
                bytes_in: get(&c.bytes_in),
                packets_out: get(&c.packets_out),
                bytes_out: get(&c.bytes_out),
            })
            .collect();
        links.sort_by_key(|l| l.link);

        StatsSnapshot {
            received: get(&self.received),
            forwarded: get(&self.forwarded),
            transmitted: get(&self.transmitted),
            control_handled: get(&self.control_handled),
            drops: DropCounts {
                malformed: get(&self.drop_malformed),
                unknown_comtree: get(&self.drop_unknown_comtree),
                not_member: get(&self.drop_not_member),
                queue_full: get(&self.drop_queue_full),
                pool_exhausted: get(&self.drop_pool_exhausted),
                control_queue_full: get(&self.drop_control_queue_full),
                no_route: get(&self.drop_no_route),
                unknown_peer: get(&self.drop_unknown_peer),
                untrusted: get(&self.drop_untrusted),
            },
            protocol_errors: get(&self.protocol_errors),
            admission_denials: get(&self.admission_denials),
            topology_errors: get(&self.topology_errors),
            retransmissions: get(&self.retransmissions),
            requests_failed: get(&self.requests_failed),
            unmatched_replies: get(&self.unmatched_replies),
            links,
        }
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub malformed: u64,
    pub unknown_comtree: u64,
    pub not_member: u64,
    pub queue_full: u64,
    pub pool_exhausted: u64,
    pub control_queue_full: u64,
    pub no_route: u64,
    pub unknown_peer: u64,
    pub untrusted: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.malformed
            + self.unknown_comtree
            + self.not_member
            + self.queue_full
            + self.pool_exhausted
            + self.control_queue_full
            + self.no_route
            + self.unknown_peer
            + self.untrusted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub transmitted: u64,
    pub control_handled: u64,
    pub drops: DropCounts,
    pub protocol_errors: u64,
    pub admission_denials: u64,
    pub topology_errors: u64,
    pub retransmissions: u64,
    pub requests_failed: u64,
    pub unmatched_replies: u64,
    pub links: Vec<LinkStatsSnapshot>,
}
