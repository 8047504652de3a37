//! # Forwarding Engine
//!
//! Per-datagram path: decode and validate the header, hand signalling for
//! this router to the control engine, and fan everything else out along the
//! comtree. Nothing here blocks. A full queue, an exhausted pool or a packet
//! on an unknown comtree is dropped and counted.
//!
//! Packets from client links are held to stricter rules: the source must be
//! the client's own address, network signalling and route replies are
//! refused, and client signalling is confined to comtrees up to
//! [`MAX_CLIENT_SIGNAL_COMTREE`].
//!
//! ## Unicast
//!
//! A destination that is the peer of a member link goes only there, then a
//! route from [`crate::route::RouteTable`], and otherwise the packet floods
//! along the tree with [`FLAG_ROUTE_REQUEST`] raised. The first router that
//! knows a route clears the flag and sends a route reply back toward the
//! source; routers on the way learn the route from it.
//!
//! ## Multicast
//!
//! Groups with subscribers at this router go to the subscribed links and
//! the upstream link; other groups follow the whole tree. Subscription
//! packets are consumed here and only changes travel upstream.

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use quanta::Instant;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::engine::Inbound;
use crate::ids::{ComtreeId, FlatAddr, LinkId};
use crate::link::PeerType;
use crate::route::{Route, Subscription};
use crate::state::RouterState;
use crate::stats::DropReason;
use crate::wire::{Packet, PacketHeader, PacketType, FLAG_ROUTE_REQUEST};

/// Highest comtree a client may send signalling on.
pub const MAX_CLIENT_SIGNAL_COMTREE: u32 = 100;

/// What happened to a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the control engine.
    Control,
    /// Queued on this many egress links.
    Forwarded(usize),
    /// Handled at this router: subscriptions and route replies that end here.
    Consumed,
    Dropped(DropReason),
}

/// Which client rule `hdr` breaks, if any.
fn client_violation(hdr: &PacketHeader, peer: FlatAddr) -> Option<&'static str> {
    if hdr.src != peer {
        return Some("source is not the client address");
    }
    match hdr.packet_type {
        PacketType::NetSignal | PacketType::RouteReply => Some("network packet type"),
        PacketType::ClientSignal if hdr.comtree.0 > MAX_CLIENT_SIGNAL_COMTREE => {
            Some("signalling on a reserved comtree")
        }
        _ => None,
    }
}

pub struct ForwardingEngine {
    state: Arc<RouterState>,
    control_tx: Sender<Inbound>,
}

impl ForwardingEngine {
    pub fn new(state: Arc<RouterState>, control_tx: Sender<Inbound>) -> Self {
        ForwardingEngine { state, control_tx }
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    fn drop_packet(&self, reason: DropReason) -> Disposition {
        self.state.stats.record_drop(reason);
        Disposition::Dropped(reason)
    }

    /// Member links of `comtree` a packet from `link` may leave on.
    fn tree(&self, comtree: ComtreeId, link: LinkId) -> Result<Arc<[LinkId]>, Disposition> {
        self.state.comtrees.lookup_route(comtree, link).map_err(|err| {
            debug!(link = %link, comtree = %comtree, error = %err, "no route");
            self.drop_packet(DropReason::for_error(&err).unwrap_or(DropReason::NoRoute))
        })
    }

    /// Process one datagram received on `link`.
    pub fn receive(&self, link: LinkId, datagram: Bytes) -> Disposition {
        self.state.stats.record_received(link, datagram.len());
        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(err) => {
                debug!(link = %link, error = %err, "malformed packet");
                return self.drop_packet(DropReason::Malformed);
            }
        };
        let mut hdr = packet.header;

        if let Some((peer, PeerType::Client)) = self.state.links.peer(link) {
            if let Some(rule) = client_violation(&hdr, peer) {
                debug!(link = %link, src = %hdr.src, ptype = ?hdr.packet_type, rule, "client packet refused");
                return self.drop_packet(DropReason::Untrusted);
            }
        }

        match hdr.packet_type {
            PacketType::SubUnsub => return self.subscription(link, packet),
            PacketType::RouteReply => return self.route_reply(link, packet),
            _ => {}
        }

        if hdr.packet_type.is_control() && hdr.dst == self.state.addr() {
            return match self.control_tx.try_send(Inbound { link, packet }) {
                Ok(()) => Disposition::Control,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    debug!(link = %link, "control queue full");
                    self.drop_packet(DropReason::ControlQueueFull)
                }
            };
        }

        let tree = match self.tree(hdr.comtree, link) {
            Ok(t) => t,
            Err(dropped) => return dropped,
        };
        if hdr.dst == self.state.addr() {
            trace!(link = %link, "data addressed to router, discarding");
            return self.drop_packet(DropReason::NoRoute);
        }

        let egress: Cow<'_, [LinkId]> = if hdr.dst.is_unicast() {
            match self.known_link(hdr.comtree, hdr.dst, &tree) {
                Some(out) => {
                    if hdr.flags & FLAG_ROUTE_REQUEST != 0 {
                        self.answer_route_request(link, &hdr);
                        hdr.flags &= !FLAG_ROUTE_REQUEST;
                    }
                    Cow::Owned(vec![out])
                }
                None => {
                    if hdr.packet_type == PacketType::Data {
                        hdr.flags |= FLAG_ROUTE_REQUEST;
                    }
                    Cow::Borrowed(&tree[..])
                }
            }
        } else {
            self.multicast_egress(hdr.comtree, hdr.dst, &tree)
        };
        self.fan_out(link, hdr, packet.payload, &egress)
    }

    /// The one member link toward unicast `dst`: its direct peer, else a
    /// route entry.
    fn known_link(&self, comtree: ComtreeId, dst: FlatAddr, tree: &[LinkId]) -> Option<LinkId> {
        if let Some(direct) = tree
            .iter()
            .copied()
            .find(|l| self.state.links.peer_addr(*l) == Some(dst))
        {
            return Some(direct);
        }
        match self.state.routes.lookup(comtree, dst, self.state.addr().zip()) {
            Some(Route::Unicast(l)) if tree.contains(&l) => Some(l),
            _ => None,
        }
    }

    fn multicast_egress<'a>(
        &self,
        comtree: ComtreeId,
        group: FlatAddr,
        tree: &'a [LinkId],
    ) -> Cow<'a, [LinkId]> {
        let Some(Route::Multicast(subscribers)) =
            self.state.routes.lookup(comtree, group, self.state.addr().zip())
        else {
            return Cow::Borrowed(tree);
        };
        let upstream = self.state.comtrees.read(comtree, |e| e.upstream()).ok().flatten();
        Cow::Owned(
            tree.iter()
                .copied()
                .filter(|l| subscribers.contains(l) || Some(*l) == upstream)
                .collect(),
        )
    }

    /// Clone the packet onto every egress queue and release the original.
    fn fan_out(&self, link: LinkId, hdr: PacketHeader, payload: Bytes, egress: &[LinkId]) -> Disposition {
        if egress.is_empty() {
            return self.drop_packet(DropReason::NoRoute);
        }
        let len = hdr.packet_len();
        let original = match self.state.store.allocate(hdr, Some(link), payload) {
            Ok(h) => h,
            Err(_) => return self.drop_packet(DropReason::PoolExhausted),
        };
        let mut copies = 0;
        for &out in egress {
            let clone = match self.state.store.clone_packet(original) {
                Ok(h) => h,
                Err(_) => {
                    self.state.stats.record_drop(DropReason::PoolExhausted);
                    continue;
                }
            };
            match self.state.queues.enqueue(out, hdr.comtree, clone, len) {
                Ok(()) => copies += 1,
                Err(err) => {
                    if let Err(gone) = self.state.store.release(clone) {
                        debug!(link = %out, error = %gone, "clone already released");
                    }
                    self.state
                        .stats
                        .record_drop(DropReason::for_error(&err).unwrap_or(DropReason::QueueFull));
                }
            }
        }
        if let Err(gone) = self.state.store.release(original) {
            debug!(link = %link, error = %gone, "original already released");
        }

        if copies == 0 {
            return Disposition::Dropped(DropReason::QueueFull);
        }
        self.state.stats.record_forwarded();
        Disposition::Forwarded(copies)
    }

    // ─── Route Learning ──────────────────────────────────────────────────────

    /// Tell the source of `hdr` that `hdr.dst` is reachable through here.
    fn answer_route_request(&self, ingress: LinkId, hdr: &PacketHeader) {
        if !hdr.src.is_unicast() {
            return;
        }
        let payload = Bytes::copy_from_slice(&hdr.dst.0.to_be_bytes());
        let header = PacketHeader::new(
            PacketType::RouteReply,
            hdr.comtree,
            self.state.addr(),
            hdr.src,
            payload.len() as u16,
        );
        if let Err(err) = self.state.send_control(ingress, &Packet::new(header, payload)) {
            debug!(link = %ingress, error = %err, "route reply dropped");
        }
    }

    /// Learn the advertised route, then pass the reply on toward its
    /// destination over router links.
    fn route_reply(&self, link: LinkId, packet: Packet) -> Disposition {
        let mut hdr = packet.header;
        let Ok(raw) = <[u8; 4]>::try_from(&packet.payload[..]) else {
            debug!(link = %link, len = packet.payload.len(), "bad route reply");
            return self.drop_packet(DropReason::Malformed);
        };
        let learned = FlatAddr(u32::from_be_bytes(raw));
        let tree = match self.tree(hdr.comtree, link) {
            Ok(t) => t,
            Err(dropped) => return dropped,
        };
        if self.state.routes.learn(hdr.comtree, learned, link) {
            debug!(comtree = %hdr.comtree, dest = %learned, link = %link, "route learned");
        }
        if hdr.dst == self.state.addr() {
            return Disposition::Consumed;
        }
        match self.known_link(hdr.comtree, hdr.dst, &tree) {
            Some(out) if self.state.links.peer(out).map(|(_, t)| t) == Some(PeerType::Router) => {
                self.fan_out(link, hdr, packet.payload, &[out])
            }
            Some(_) => Disposition::Consumed,
            None => {
                hdr.flags |= FLAG_ROUTE_REQUEST;
                self.fan_out(link, hdr, packet.payload, &tree)
            }
        }
    }

    // ─── Subscriptions ───────────────────────────────────────────────────────

    /// Apply a subscription from a member below this router and pass the
    /// groups that appeared or vanished here on toward the core.
    fn subscription(&self, link: LinkId, packet: Packet) -> Disposition {
        let comtree = packet.header.comtree;
        let sub = match Subscription::decode(packet.payload) {
            Ok(s) => s,
            Err(err) => {
                debug!(link = %link, error = %err, "malformed subscription");
                return self.drop_packet(DropReason::Malformed);
            }
        };
        let upstream = match self
            .state
            .comtrees
            .read(comtree, |e| (e.is_member(link), e.upstream(), e.is_core()))
        {
            Ok((true, upstream, is_core)) => upstream.filter(|_| !is_core),
            Ok((false, ..)) => return self.drop_packet(DropReason::NotMember),
            Err(err) => {
                return self.drop_packet(DropReason::for_error(&err).unwrap_or(DropReason::UnknownComtree))
            }
        };
        if upstream == Some(link) {
            trace!(link = %link, comtree = %comtree, "subscription from upstream ignored");
            return Disposition::Consumed;
        }

        let mut changed = Subscription::default();
        for group in sub.join.into_iter().filter(|g| g.is_multicast()) {
            match self.state.routes.subscribe(comtree, group, link) {
                Ok(true) => changed.join.push(group),
                Ok(false) => {}
                Err(err) => debug!(link = %link, group = %group, error = %err, "subscription refused"),
            }
        }
        for group in sub.leave.into_iter().filter(|g| g.is_multicast()) {
            if self.state.routes.unsubscribe(comtree, group, link) {
                changed.leave.push(group);
            }
        }

        if let (Some(up), false) = (upstream, changed.is_empty()) {
            let Some(peer) = self.state.links.peer_addr(up) else {
                return Disposition::Consumed;
            };
            let payload = changed.to_bytes();
            let header = PacketHeader::new(
                PacketType::SubUnsub,
                comtree,
                self.state.addr(),
                peer,
                payload.len() as u16,
            );
            if let Err(err) = self.state.send_control(up, &Packet::new(header, payload)) {
                debug!(link = %up, error = %err, "subscription not propagated");
            }
        }
        Disposition::Consumed
    }

    // ─── Transmit ────────────────────────────────────────────────────────────

    /// Next datagram for `link` if its pacer allows sending at `now`.
    pub fn transmit_ready(&self, link: LinkId, now: Instant) -> Option<Bytes> {
        let handle = self.state.queues.dequeue_ready(link, now)?;
        self.render(link, handle)
    }

    /// Next datagram for `link`, ignoring pacing.
    pub fn transmit_next(&self, link: LinkId) -> Option<Bytes> {
        let handle = self.state.queues.dequeue(link)?;
        self.render(link, handle)
    }

    fn render(&self, link: LinkId, handle: crate::pool::PacketHandle) -> Option<Bytes> {
        match self.state.store.take_datagram(handle) {
            Ok(dgram) => {
                self.state.stats.record_transmitted(link, dgram.len());
                Some(dgram.freeze())
            }
            Err(err) => {
                debug!(link = %link, error = %err, "queued handle vanished");
                None
            }
        }
    }
}
