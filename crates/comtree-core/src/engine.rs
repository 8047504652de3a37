//! # Control Protocol Engine
//!
//! Handles signalling packets addressed to this router. Each control type
//! maps to one handler; a handler validates its attributes, applies the
//! change to the link, comtree and queue tables, and either answers at once
//! or defers the answer until a request it forwarded toward the core is
//! resolved.
//!
//! Received signalling waits in a bounded backlog; when it is full, new
//! packets are refused and counted. Follow-up actions (replies, forwarded
//! requests, outcome reports) go on a separate internal queue that is never
//! truncated, and all of it runs before the next backlog packet is
//! dispatched, in order and never by recursion. The engine is driven by a
//! single control activity, so work items never interleave with each other.
//!
//! ## Join
//!
//! ```text
//!   child ──Join──▶ router ──Join──▶ ... ──▶ core
//!                     │ reserve child rate, attach
//!                     │ not attached? provision upstream, forward, wait
//!   child ◀─reply──── router ◀─reply/timeout──
//! ```
//!
//! Every originator waiting on a forwarded join hears the outcome exactly
//! once. A rejection or timeout undoes the local provisioning.

use crossbeam_channel::{Receiver, TryRecvError};
use quanta::Instant;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::comtree::{ComtreeUpdate, MemberOrigin};
use crate::control::{AttrCode, ControlPacket, ControlType, Mode};
use crate::error::{Resource, Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr, LinkId};
use crate::link::{LinkEntry, PeerType};
use crate::pending::{PendingTable, TimerAction, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_TIMEOUT};
use crate::state::{Attach, RouterState};
use crate::stats::DropReason;
use crate::wire::{Packet, PacketHeader, PacketType};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry_timeout: Duration,
    pub max_attempts: u32,
    /// Received signalling packets that may wait for a handler.
    pub work_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            work_queue_capacity: 1024,
        }
    }
}

// ─── Work Items ──────────────────────────────────────────────────────────────

/// A signalling packet for the engine, tagged with its ingress link.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub link: LinkId,
    pub packet: Packet,
}

#[derive(Debug, Clone)]
struct Waiter {
    link: LinkId,
    header: PacketHeader,
    request: ControlPacket,
}

#[derive(Debug, Clone)]
enum PendingContext {
    Join {
        comtree: ComtreeId,
        upstream: LinkId,
        waiters: Vec<Waiter>,
    },
    Leave {
        comtree: ComtreeId,
    },
}

impl PendingContext {
    /// Control type the awaited reply must carry.
    fn ctype(&self) -> ControlType {
        match self {
            PendingContext::Join { .. } => ControlType::Join,
            PendingContext::Leave { .. } => ControlType::Leave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Accepted,
    Rejected(String),
    TimedOut,
}

#[derive(Debug)]
enum Work {
    Reply {
        link: LinkId,
        request: PacketHeader,
        reply: ControlPacket,
    },
    Transmit {
        link: LinkId,
        packet: Packet,
        pending: Option<u64>,
    },
    Resolve {
        seq: u64,
        context: PendingContext,
        outcome: Outcome,
    },
}

/// What a handler decided about the reply.
enum Answer {
    Now(ControlPacket),
    Deferred,
}

struct Request {
    link: LinkId,
    header: PacketHeader,
    ctl: ControlPacket,
}

type Handler = fn(&mut ControlEngine, &Request, Instant) -> Result<Answer>;

// ─── Attribute Helpers ───────────────────────────────────────────────────────

fn narrow<T: TryFrom<u64>>(ctl: &ControlPacket, code: AttrCode, v: u64) -> Result<T> {
    T::try_from(v).map_err(|_| {
        RouterError::protocol(format!("{code:?} value {v} out of range for {}", ctl.ctype))
    })
}

fn req<T: TryFrom<u64>>(ctl: &ControlPacket, code: AttrCode) -> Result<T> {
    narrow(ctl, code, ctl.require_int(code)?)
}

fn opt<T: TryFrom<u64>>(ctl: &ControlPacket, code: AttrCode) -> Result<Option<T>> {
    ctl.get_int(code).map(|v| narrow(ctl, code, v)).transpose()
}

fn comtree_attr(ctl: &ControlPacket) -> Result<ComtreeId> {
    req(ctl, AttrCode::Comtree).map(ComtreeId)
}

fn link_attr(ctl: &ControlPacket, code: AttrCode) -> Result<LinkId> {
    req(ctl, code).map(LinkId)
}

fn dest_attr(ctl: &ControlPacket) -> Result<FlatAddr> {
    req(ctl, AttrCode::DestAddr).map(FlatAddr)
}

fn peer_type_from(v: u8) -> Result<PeerType> {
    match v {
        0 => Ok(PeerType::Client),
        1 => Ok(PeerType::Router),
        2 => Ok(PeerType::Controller),
        _ => Err(RouterError::protocol(format!("bad peer type {v}"))),
    }
}

fn peer_type_code(t: PeerType) -> u64 {
    match t {
        PeerType::Client => 0,
        PeerType::Router => 1,
        PeerType::Controller => 2,
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct ControlEngine {
    state: Arc<RouterState>,
    inbound: Option<Receiver<Inbound>>,
    pending: PendingTable<PendingContext>,
    backlog: VecDeque<Inbound>,
    backlog_capacity: usize,
    work: VecDeque<Work>,
    /// Upstream join currently outstanding per comtree.
    joins_in_flight: HashMap<ComtreeId, u64>,
}

impl ControlEngine {
    pub fn new(state: Arc<RouterState>, config: EngineConfig) -> Self {
        ControlEngine {
            state,
            inbound: None,
            pending: PendingTable::new(config.retry_timeout, config.max_attempts),
            backlog: VecDeque::with_capacity(config.work_queue_capacity),
            backlog_capacity: config.work_queue_capacity.max(1),
            work: VecDeque::new(),
            joins_in_flight: HashMap::new(),
        }
    }

    /// Attach the channel the forwarding path feeds.
    pub fn with_inbound(mut self, inbound: Receiver<Inbound>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    /// Outstanding requests this router is waiting on.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Earliest retransmission deadline, for sleeping the control activity.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    fn push(&mut self, work: Work) {
        self.work.push_back(work);
    }

    /// Queue a signalling packet received on `link`. Refused when the
    /// backlog is full.
    pub fn submit(&mut self, link: LinkId, packet: Packet) -> Result<()> {
        if self.backlog.len() >= self.backlog_capacity {
            warn!(link = %link, backlog = self.backlog.len(), "control backlog full, dropping");
            self.state.stats.record_drop(DropReason::ControlQueueFull);
            return Err(RouterError::ResourceExhausted(Resource::ControlQueue));
        }
        self.backlog.push_back(Inbound { link, packet });
        Ok(())
    }

    /// Pull inbound packets, fire due timers and run queued work. Returns the
    /// number of packets and work items executed.
    pub fn poll(&mut self, now: Instant) -> usize {
        self.drain_inbound();
        self.tick(now);
        self.run(now)
    }

    fn drain_inbound(&mut self) {
        let Some(rx) = self.inbound.clone() else {
            return;
        };
        while self.backlog.len() < self.backlog_capacity {
            match rx.try_recv() {
                Ok(inbound) => self.backlog.push_back(inbound),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Retransmit overdue requests and fail those out of attempts.
    pub fn tick(&mut self, now: Instant) {
        for action in self.pending.poll_timeouts(now) {
            match action {
                TimerAction::Retransmit(req) => {
                    self.state.stats.record_retransmission();
                    debug!(seq = req.seq(), link = %req.link(), attempt = req.attempts(), "retransmitting");
                    let packet = req.packet().clone();
                    self.push(Work::Transmit {
                        link: req.link(),
                        packet,
                        pending: None,
                    });
                }
                TimerAction::Failed(req) => {
                    let err = RouterError::Timeout;
                    self.state.stats.record_error(&err);
                    warn!(seq = req.seq(), link = %req.link(), error = %err, "request failed");
                    let context = req.context().clone();
                    self.push(Work::Resolve {
                        seq: req.seq(),
                        context,
                        outcome: Outcome::TimedOut,
                    });
                }
            }
        }
    }

    /// Dispatch the backlog until it is empty, finishing all follow-up work
    /// before each next packet.
    pub fn run(&mut self, now: Instant) -> usize {
        let mut done = 0;
        loop {
            while let Some(work) = self.work.pop_front() {
                self.execute(work);
                done += 1;
            }
            let Some(inbound) = self.backlog.pop_front() else {
                break;
            };
            self.dispatch(inbound, now);
            done += 1;
        }
        done
    }

    fn execute(&mut self, work: Work) {
        match work {
            Work::Reply {
                link,
                request,
                reply,
            } => {
                let payload = reply.to_bytes();
                let header = request.reversed(payload.len() as u16);
                let packet = Packet::new(header, payload);
                if let Err(err) = self.state.send_control(link, &packet) {
                    debug!(link = %link, error = %err, "reply dropped");
                }
            }
            Work::Transmit {
                link,
                packet,
                pending,
            } => {
                if let Err(err) = self.state.send_control(link, &packet) {
                    debug!(link = %link, error = %err, "request not queued, timer will retry");
                }
                if let Some(req) = pending.and_then(|seq| self.pending.get(seq)) {
                    req.mark_sent();
                }
            }
            Work::Resolve {
                seq,
                context,
                outcome,
            } => self.resolve(seq, context, outcome),
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    fn dispatch(&mut self, inbound: Inbound, now: Instant) {
        let Inbound { link, packet } = inbound;
        let ctl = match ControlPacket::from_packet(&packet) {
            Ok(ctl) => ctl,
            Err(err) => {
                self.state.stats.record_protocol_error();
                warn!(link = %link, error = %err, "malformed control packet");
                return;
            }
        };
        self.state.stats.record_control();

        if ctl.mode.is_reply() {
            self.handle_reply(link, ctl);
            return;
        }

        let request = Request {
            link,
            header: packet.header,
            ctl,
        };
        let handler = Self::handler(request.ctl.ctype);
        match handler(self, &request, now) {
            Ok(Answer::Now(reply)) => {
                self.push(Work::Reply {
                    link,
                    request: request.header,
                    reply,
                });
            }
            Ok(Answer::Deferred) => {}
            Err(err) => {
                self.state.stats.record_error(&err);
                debug!(link = %link, ctype = %request.ctl.ctype, error = %err, "request refused");
                self.push(Work::Reply {
                    link,
                    request: request.header,
                    reply: request.ctl.negative_reply(err.to_string()),
                });
            }
        }
    }

    fn handler(ctype: ControlType) -> Handler {
        match ctype {
            ControlType::Join => Self::on_join,
            ControlType::Leave => Self::on_leave,
            ControlType::AddLink => Self::on_add_link,
            ControlType::DropLink => Self::on_drop_link,
            ControlType::GetLink => Self::on_get_link,
            ControlType::ModLink => Self::on_mod_link,
            ControlType::AddComtree => Self::on_add_comtree,
            ControlType::DropComtree => Self::on_drop_comtree,
            ControlType::GetComtree => Self::on_get_comtree,
            ControlType::ModComtree => Self::on_mod_comtree,
            ControlType::AddComtreeLink => Self::on_add_comtree_link,
            ControlType::DropComtreeLink => Self::on_drop_comtree_link,
            ControlType::ResizeComtreeLink => Self::on_resize_comtree_link,
            ControlType::AddRoute => Self::on_add_route,
            ControlType::DropRoute => Self::on_drop_route,
            ControlType::GetRoute => Self::on_get_route,
            ControlType::ModRoute => Self::on_mod_route,
            ControlType::AddRouteLink => Self::on_add_route_link,
            ControlType::DropRouteLink => Self::on_drop_route_link,
        }
    }

    /// A reply completes its request only if it comes back over the link the
    /// request went out on and answers the same control type.
    fn handle_reply(&mut self, link: LinkId, ctl: ControlPacket) {
        let expected = self
            .pending
            .get(ctl.seq)
            .is_some_and(|req| req.link() == link && req.context().ctype() == ctl.ctype);
        let completed = if expected { self.pending.complete(ctl.seq) } else { None };
        let Some(req) = completed else {
            self.state.stats.record_unmatched_reply();
            debug!(link = %link, seq = ctl.seq, ctype = %ctl.ctype, "unmatched reply");
            return;
        };
        let outcome = match ctl.mode {
            Mode::NegReply => Outcome::Rejected(ctl.err_msg().unwrap_or("rejected").to_owned()),
            _ => Outcome::Accepted,
        };
        let context = req.context().clone();
        self.push(Work::Resolve {
            seq: ctl.seq,
            context,
            outcome,
        });
    }

    /// Register a request that expects a reply and queue its transmission.
    fn send_request(
        &mut self,
        link: LinkId,
        ctl: ControlPacket,
        comtree: ComtreeId,
        context: PendingContext,
        now: Instant,
    ) -> Result<u64> {
        let dst = self
            .state
            .links
            .peer_addr(link)
            .ok_or(RouterError::UnknownLink(link))?;
        let seq = ctl.seq;
        let packet = ctl.to_packet(comtree, self.state.addr(), dst);
        self.pending.register(seq, link, packet.clone(), context, now);
        self.push(Work::Transmit {
            link,
            packet,
            pending: Some(seq),
        });
        Ok(seq)
    }

    // ─── Outcome Resolution ──────────────────────────────────────────────────

    fn resolve(&mut self, seq: u64, context: PendingContext, outcome: Outcome) {
        match context {
            PendingContext::Join {
                comtree,
                upstream,
                waiters,
            } => {
                if self.joins_in_flight.get(&comtree) == Some(&seq) {
                    self.joins_in_flight.remove(&comtree);
                }
                match outcome {
                    Outcome::Accepted => {
                        info!(comtree = %comtree, waiters = waiters.len(), "upstream join accepted");
                        for w in waiters {
                            self.push(Work::Reply {
                                link: w.link,
                                request: w.header,
                                reply: w.request.positive_reply(),
                            });
                        }
                    }
                    failed => {
                        let reason = match failed {
                            Outcome::Rejected(msg) => format!("upstream rejected join: {msg}"),
                            _ => format!("upstream join failed: {}", RouterError::Timeout),
                        };
                        warn!(comtree = %comtree, %reason, "rolling back join");
                        self.rollback_join(comtree, upstream, &waiters);
                        for w in waiters {
                            self.push(Work::Reply {
                                link: w.link,
                                request: w.header,
                                reply: w.request.negative_reply(reason.clone()),
                            });
                        }
                    }
                }
            }
            PendingContext::Leave { comtree } => match outcome {
                Outcome::Accepted => debug!(comtree = %comtree, "upstream leave acknowledged"),
                other => warn!(comtree = %comtree, outcome = ?other, "upstream leave not acknowledged"),
            },
        }
    }

    fn rollback_join(&mut self, comtree: ComtreeId, upstream: LinkId, waiters: &[Waiter]) {
        let state = self.state.clone();
        for w in waiters {
            let joined = state
                .comtrees
                .read(comtree, |e| e.member(w.link))
                .ok()
                .flatten()
                .is_some_and(|m| m.origin == MemberOrigin::Joined);
            if joined && state.drop_comtree_link(comtree, w.link).is_err() {
                debug!(comtree = %comtree, link = %w.link, "waiter already gone");
            }
        }
        let provisioned = state
            .comtrees
            .read(comtree, |e| {
                e.upstream() == Some(upstream)
                    && e.member(upstream).map(|m| m.origin) == Some(MemberOrigin::Joined)
                    && e.children(upstream).next().is_none()
            })
            .unwrap_or(false);
        if provisioned {
            if let Err(err) = state.drop_comtree_link(comtree, upstream) {
                warn!(comtree = %comtree, link = %upstream, error = %err, "upstream not released");
            }
        }
    }

    /// Withdraw the join in flight for `comtree`, refusing every waiter.
    fn abandon_join(&mut self, comtree: ComtreeId, reason: &str) {
        let Some(seq) = self.joins_in_flight.remove(&comtree) else {
            return;
        };
        let Some(req) = self.pending.cancel(seq) else {
            return;
        };
        let waiters = match &*req.context() {
            PendingContext::Join { waiters, .. } => waiters.clone(),
            PendingContext::Leave { .. } => Vec::new(),
        };
        debug!(comtree = %comtree, seq, waiters = waiters.len(), %reason, "join abandoned");
        for w in waiters {
            self.push(Work::Reply {
                link: w.link,
                request: w.header,
                reply: w.request.negative_reply(reason),
            });
        }
    }

    fn undo_attach(&self, comtree: ComtreeId, link: LinkId) {
        if let Err(err) = self.state.drop_comtree_link(comtree, link) {
            warn!(comtree = %comtree, link = %link, error = %err, "join not undone");
        }
    }

    // ─── Join / Leave ────────────────────────────────────────────────────────

    fn on_join(&mut self, r: &Request, now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let rate: u32 = opt(&r.ctl, AttrCode::Rate)?.unwrap_or(0);
        let child = r.link;
        let state = self.state.clone();

        let (is_core, upstream, core_link, core_addr, already) = state.comtrees.read(comtree, |e| {
            (e.is_core(), e.upstream(), e.core_link(), e.core_addr(), e.is_member(child))
        })?;
        let in_flight = self.joins_in_flight.get(&comtree).copied();
        let waiter = Waiter {
            link: child,
            header: r.header,
            request: r.ctl.clone(),
        };

        if already {
            // Retransmitted join: answer again, or wait with the others.
            return Ok(match in_flight {
                Some(seq) => {
                    self.add_waiter(seq, waiter);
                    Answer::Deferred
                }
                None => Answer::Now(r.ctl.positive_reply()),
            });
        }

        if is_core || upstream.is_some() {
            state.add_comtree_link(comtree, child, Attach::Below(None), MemberOrigin::Joined, rate)?;
            info!(comtree = %comtree, link = %child, rate, "join accepted");
            return Ok(match in_flight {
                Some(seq) => {
                    self.add_waiter(seq, waiter);
                    Answer::Deferred
                }
                None => Answer::Now(r.ctl.positive_reply()),
            });
        }

        let up = core_link
            .or_else(|| state.links.link_for_peer(core_addr))
            .ok_or_else(|| RouterError::topology(format!("no link toward core of {comtree}")))?;
        if up == child {
            return Err(RouterError::topology(format!(
                "join for {comtree} arrived from the core side"
            )));
        }

        state.add_comtree_link(comtree, up, Attach::Upstream, MemberOrigin::Joined, rate)?;
        if let Err(err) =
            state.add_comtree_link(comtree, child, Attach::Below(Some(up)), MemberOrigin::Joined, rate)
        {
            self.undo_attach(comtree, up);
            return Err(err);
        }

        let fwd = ControlPacket::request(ControlType::Join, self.pending.next_seq())
            .with_int(AttrCode::Comtree, comtree.0 as u64)
            .with_int(AttrCode::Rate, rate as u64);
        let context = PendingContext::Join {
            comtree,
            upstream: up,
            waiters: vec![waiter],
        };
        match self.send_request(up, fwd, comtree, context, now) {
            Ok(seq) => {
                info!(comtree = %comtree, link = %child, upstream = %up, seq, "join forwarded toward core");
                self.joins_in_flight.insert(comtree, seq);
                Ok(Answer::Deferred)
            }
            Err(err) => {
                self.undo_attach(comtree, child);
                self.undo_attach(comtree, up);
                Err(err)
            }
        }
    }

    fn add_waiter(&mut self, seq: u64, waiter: Waiter) {
        let Some(req) = self.pending.get(seq) else {
            return;
        };
        if let PendingContext::Join { waiters, .. } = &mut *req.context() {
            if !waiters.iter().any(|w| w.link == waiter.link && w.request.seq == waiter.request.seq) {
                waiters.push(waiter);
            }
        };
    }

    fn on_leave(&mut self, r: &Request, now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let child = r.link;
        let state = self.state.clone();

        if !state.comtrees.read(comtree, |e| e.is_member(child))? {
            return Ok(Answer::Now(r.ctl.positive_reply()));
        }
        let outcome = state.comtrees.apply_leave(comtree, child)?;
        for (link, _) in &outcome.removed {
            state.release_member(comtree, *link);
        }
        info!(comtree = %comtree, link = %child, removed = outcome.removed.len(), "leave applied");

        if let Some(up) = outcome.upstream_pruned {
            self.abandon_join(comtree, &format!("{comtree} left before the core answered"));
            let fwd = ControlPacket::request(ControlType::Leave, self.pending.next_seq())
                .with_int(AttrCode::Comtree, comtree.0 as u64);
            if let Err(err) = self.send_request(up, fwd, comtree, PendingContext::Leave { comtree }, now) {
                warn!(comtree = %comtree, upstream = %up, error = %err, "could not propagate leave");
            }
        }
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    // ─── Links ───────────────────────────────────────────────────────────────

    fn on_add_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let ctl = &r.ctl;
        let link = link_attr(ctl, AttrCode::Link)?;
        let peer = FlatAddr(req(ctl, AttrCode::PeerAddr)?);
        let capacity: u32 = req(ctl, AttrCode::Capacity)?;
        let peer_type = match opt::<u8>(ctl, AttrCode::PeerType)? {
            Some(t) => peer_type_from(t)?,
            None => PeerType::default(),
        };
        let mut entry = LinkEntry::new(link, peer, capacity).with_peer_type(peer_type);
        if let (Some(ip), Some(port)) = (
            opt::<u32>(ctl, AttrCode::PeerIp)?,
            opt::<u16>(ctl, AttrCode::PeerPort)?,
        ) {
            entry = entry.with_endpoint(SocketAddr::from((Ipv4Addr::from(ip), port)));
        }
        self.state.add_link(entry)?;
        info!(link = %link, peer = %peer, capacity, "link added");
        Ok(Answer::Now(ctl.positive_reply().with_int(AttrCode::Link, link.0 as u64)))
    }

    fn on_drop_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        self.state.remove_link(link)?;
        info!(link = %link, "link dropped");
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_get_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        let entry = self.state.links.get(link)?;
        let mut reply = r
            .ctl
            .positive_reply()
            .with_int(AttrCode::Link, link.0 as u64)
            .with_int(AttrCode::PeerAddr, entry.peer_addr.0 as u64)
            .with_int(AttrCode::PeerType, peer_type_code(entry.peer_type))
            .with_int(AttrCode::Capacity, entry.capacity as u64)
            .with_int(AttrCode::Allocated, entry.allocated() as u64);
        if let Some(SocketAddr::V4(v4)) = entry.endpoint {
            reply = reply
                .with_int(AttrCode::PeerIp, u32::from(*v4.ip()) as u64)
                .with_int(AttrCode::PeerPort, v4.port() as u64);
        }
        Ok(Answer::Now(reply))
    }

    fn on_mod_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        let capacity: u32 = req(&r.ctl, AttrCode::Capacity)?;
        self.state.modify_link(link, capacity)?;
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    // ─── Comtrees ────────────────────────────────────────────────────────────

    fn on_add_comtree(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let ctl = &r.ctl;
        let comtree = comtree_attr(ctl)?;
        let core_addr = opt(ctl, AttrCode::CoreAddr)?
            .map(FlatAddr)
            .unwrap_or(self.state.addr());
        let is_core = match opt::<u8>(ctl, AttrCode::IsCore)? {
            Some(v) => v != 0,
            None => core_addr == self.state.addr(),
        };
        self.state.comtrees.add_comtree(comtree, core_addr, is_core)?;
        if let Some(link) = opt(ctl, AttrCode::ParentLink)?.map(LinkId) {
            self.state
                .comtrees
                .update(comtree, |e| {
                    e.set_core_link(Some(link));
                    Ok(())
                })?;
        }
        info!(comtree = %comtree, core = %core_addr, is_core, "comtree added");
        Ok(Answer::Now(ctl.positive_reply()))
    }

    fn on_drop_comtree(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        self.abandon_join(comtree, &format!("{comtree} removed"));
        let info = self.state.drop_comtree(comtree)?;
        info!(comtree = %comtree, members = info.members.len(), "comtree dropped");
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_get_comtree(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let info = self.state.comtrees.get(comtree)?;
        let mut reply = r
            .ctl
            .positive_reply()
            .with_int(AttrCode::Comtree, comtree.0 as u64)
            .with_int(AttrCode::CoreAddr, info.core_addr.0 as u64)
            .with_int(AttrCode::IsCore, info.is_core as u64)
            .with_int(AttrCode::MemberCount, info.members.len() as u64);
        if let Some(up) = info.upstream {
            reply = reply.with_int(AttrCode::UpstreamLink, up.0 as u64);
        }
        Ok(Answer::Now(reply))
    }

    fn on_mod_comtree(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let ctl = &r.ctl;
        let comtree = comtree_attr(ctl)?;
        let update = ComtreeUpdate {
            core_addr: opt(ctl, AttrCode::CoreAddr)?.map(FlatAddr),
            is_core: opt::<u8>(ctl, AttrCode::IsCore)?.map(|v| v != 0),
            upstream: opt(ctl, AttrCode::UpstreamLink)?.map(|l| Some(LinkId(l))),
            core_link: opt(ctl, AttrCode::ParentLink)?.map(|l| Some(LinkId(l))),
        };
        self.state.comtrees.modify_comtree(comtree, update)?;
        Ok(Answer::Now(ctl.positive_reply()))
    }

    fn on_add_comtree_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let ctl = &r.ctl;
        let comtree = comtree_attr(ctl)?;
        let link = link_attr(ctl, AttrCode::Link)?;
        let rate: u32 = opt(ctl, AttrCode::Rate)?.unwrap_or(0);
        let attach = if opt::<u16>(ctl, AttrCode::UpstreamLink)? == Some(link.0) {
            Attach::Upstream
        } else {
            Attach::Below(opt(ctl, AttrCode::ParentLink)?.map(LinkId))
        };
        self.state
            .add_comtree_link(comtree, link, attach, MemberOrigin::Configured, rate)?;
        info!(comtree = %comtree, link = %link, rate, "comtree link added");
        Ok(Answer::Now(ctl.positive_reply()))
    }

    fn on_drop_comtree_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        self.state.drop_comtree_link(comtree, link)?;
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_resize_comtree_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        let rate: u32 = req(&r.ctl, AttrCode::Rate)?;
        self.state.resize_comtree_link(comtree, link, rate)?;
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    // ─── Routes ──────────────────────────────────────────────────────────────

    fn on_add_route(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let dest = dest_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        self.state.add_route(comtree, dest, link)?;
        info!(comtree = %comtree, dest = %dest, link = %link, "route added");
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_drop_route(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let dest = dest_attr(&r.ctl)?;
        self.state.routes.drop_route(comtree, dest)?;
        info!(comtree = %comtree, dest = %dest, "route dropped");
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_get_route(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let dest = dest_attr(&r.ctl)?;
        let links = self.state.routes.get_route(comtree, dest)?.links();
        let reply = r
            .ctl
            .positive_reply()
            .with_int(AttrCode::Comtree, comtree.0 as u64)
            .with_int(AttrCode::DestAddr, dest.0 as u64)
            .with_int(AttrCode::MemberCount, links.len() as u64);
        Ok(Answer::Now(links.into_iter().fold(reply, |reply, l| {
            reply.with_int(AttrCode::Link, l.0 as u64)
        })))
    }

    fn on_mod_route(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let dest = dest_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        self.state.mod_route(comtree, dest, link)?;
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_add_route_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let group = dest_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        self.state.subscribe(comtree, group, link)?;
        Ok(Answer::Now(r.ctl.positive_reply()))
    }

    fn on_drop_route_link(&mut self, r: &Request, _now: Instant) -> Result<Answer> {
        let comtree = comtree_attr(&r.ctl)?;
        let group = dest_attr(&r.ctl)?;
        let link = link_attr(&r.ctl, AttrCode::Link)?;
        if !group.is_multicast() {
            return Err(RouterError::protocol(format!("{group} is not a group address")));
        }
        if !self.state.routes.get_route(comtree, group)?.contains(link) {
            return Err(RouterError::topology(format!("{link} not on route to {group}")));
        }
        self.state.routes.unsubscribe(comtree, group, link);
        Ok(Answer::Now(r.ctl.positive_reply()))
    }
}

/// Wrap a control packet as a signalling packet from `src` to `dst`.
pub fn signal(
    ctl: &ControlPacket,
    comtree: ComtreeId,
    src: FlatAddr,
    dst: FlatAddr,
    client: bool,
) -> Packet {
    let mut packet = ctl.to_packet(comtree, src, dst);
    if client {
        packet.header.packet_type = PacketType::ClientSignal;
    }
    packet
}
