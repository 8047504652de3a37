//! # Scenario tests: routers wired back to back
//!
//! Several routers run in-process. The "network" moves datagrams from one
//! router's output queue to the ingress of the wired peer; unwired links
//! stand for hosts and their output is collected for inspection.

use bytes::Bytes;
use comtree_core::comtree::MemberOrigin;
use comtree_core::control::{AttrCode, ControlPacket, ControlType, Mode};
use comtree_core::engine::{signal, ControlEngine, EngineConfig};
use comtree_core::forward::{Disposition, ForwardingEngine};
use comtree_core::link::{LinkEntry, PeerType};
use comtree_core::route::Route;
use comtree_core::state::{Attach, RouterLimits, RouterState};
use comtree_core::stats::RouterStats;
use comtree_core::wire::{Packet, PacketHeader, PacketType, FLAG_ROUTE_REQUEST};
use comtree_core::{ComtreeId, FlatAddr, LinkId, RouterError};
use crossbeam_channel::bounded;
use quanta::Instant;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const C5: ComtreeId = ComtreeId(5);
const GROUP: FlatAddr = FlatAddr(0x8000_0005);

// ─── Harness ────────────────────────────────────────────────────────────────

struct Node {
    fwd: ForwardingEngine,
    ctl: ControlEngine,
}

impl Node {
    fn new(addr: FlatAddr, config: EngineConfig) -> Self {
        let state = Arc::new(RouterState::new(
            addr,
            RouterLimits::default(),
            Arc::new(RouterStats::new()),
        ));
        let (tx, rx) = bounded(64);
        Node {
            fwd: ForwardingEngine::new(state.clone(), tx),
            ctl: ControlEngine::new(state, config).with_inbound(rx),
        }
    }

    fn state(&self) -> &Arc<RouterState> {
        self.fwd.state()
    }

    fn link(&self, id: u16, peer: FlatAddr, capacity: u32) {
        self.state()
            .add_link(LinkEntry::new(LinkId(id), peer, capacity))
            .unwrap();
    }
}

#[derive(Default)]
struct Net {
    nodes: Vec<Node>,
    wires: HashMap<(usize, LinkId), (usize, LinkId)>,
    /// Datagrams that left on unwired links: (node, link, datagram).
    outside: Vec<(usize, LinkId, Bytes)>,
}

impl Net {
    fn add(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn wire(&mut self, a: (usize, u16), b: (usize, u16)) {
        self.wires.insert((a.0, LinkId(a.1)), (b.0, LinkId(b.1)));
        self.wires.insert((b.0, LinkId(b.1)), (a.0, LinkId(a.1)));
    }

    /// Run control activities and move datagrams until nothing is queued.
    fn pump(&mut self, now: Instant) {
        loop {
            let mut moved = 0;
            for node in &mut self.nodes {
                node.ctl.poll(now);
            }
            for i in 0..self.nodes.len() {
                for link in self.nodes[i].state().links.ids() {
                    while let Some(dgram) = self.nodes[i].fwd.transmit_next(link) {
                        moved += 1;
                        match self.wires.get(&(i, link)) {
                            Some(&(j, peer_link)) => {
                                self.nodes[j].fwd.receive(peer_link, dgram);
                            }
                            None => self.outside.push((i, link, dgram)),
                        }
                    }
                }
            }
            if moved == 0 {
                break;
            }
        }
    }

    fn take_outside(&mut self, node: usize, link: u16) -> Vec<Packet> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.outside)
            .into_iter()
            .partition(|(n, l, _)| *n == node && *l == LinkId(link));
        self.outside = rest;
        mine.into_iter()
            .map(|(_, _, d)| Packet::decode(d).unwrap())
            .collect()
    }
}

fn control_of(packets: &[Packet]) -> Vec<ControlPacket> {
    packets
        .iter()
        .filter(|p| p.header.packet_type.is_control())
        .map(|p| ControlPacket::from_packet(p).unwrap())
        .collect()
}

fn data(comtree: ComtreeId, src: FlatAddr, dst: FlatAddr, payload: &'static [u8]) -> Bytes {
    let hdr = PacketHeader::new(PacketType::Data, comtree, src, dst, payload.len() as u16);
    Packet::new(hdr, Bytes::from_static(payload)).encode().freeze()
}

fn join(seq: u64, rate: u64) -> ControlPacket {
    ControlPacket::request(ControlType::Join, seq)
        .with_int(AttrCode::Comtree, C5.0 as u64)
        .with_int(AttrCode::Rate, rate)
}

fn leave(seq: u64) -> ControlPacket {
    ControlPacket::request(ControlType::Leave, seq).with_int(AttrCode::Comtree, C5.0 as u64)
}

// ─── Scenario: core via A, children B and C ────────────────────────────────

#[test]
fn data_from_child_leaves_on_other_members_only() {
    const A: u16 = 1;
    const B: u16 = 2;
    const C: u16 = 3;
    let mut net = Net::default();
    let r = net.add(Node::new(FlatAddr::new(2, 1), EngineConfig::default()));
    let st = net.nodes[r].state().clone();
    net.nodes[r].link(A, FlatAddr::new(1, 1), 10_000);
    net.nodes[r].link(B, FlatAddr::new(2, 10), 10_000);
    net.nodes[r].link(C, FlatAddr::new(2, 11), 10_000);
    st.comtrees.add_comtree(C5, FlatAddr::new(1, 1), false).unwrap();
    st.add_comtree_link(C5, LinkId(A), Attach::Upstream, MemberOrigin::Configured, 100)
        .unwrap();
    st.add_comtree_link(C5, LinkId(B), Attach::Below(None), MemberOrigin::Configured, 100)
        .unwrap();
    st.add_comtree_link(C5, LinkId(C), Attach::Below(None), MemberOrigin::Configured, 100)
        .unwrap();

    let d = data(C5, FlatAddr::new(2, 11), GROUP, b"frame");
    assert_eq!(net.nodes[r].fwd.receive(LinkId(C), d), Disposition::Forwarded(2));
    net.pump(Instant::now());

    assert_eq!(net.take_outside(r, A).len(), 1);
    assert_eq!(net.take_outside(r, B).len(), 1);
    assert!(net.take_outside(r, C).is_empty());
    assert_eq!(st.store.in_use(), 0);
    assert_eq!(st.store.buffers_in_use(), 0);
}

// ─── Scenario: admission ───────────────────────────────────────────────────

#[test]
fn second_join_over_capacity_is_denied() {
    let mut net = Net::default();
    let core = net.add(Node::new(FlatAddr::new(1, 1), EngineConfig::default()));
    let st = net.nodes[core].state().clone();
    net.nodes[core].link(1, FlatAddr::new(1, 10), 100);
    st.comtrees.add_comtree(C5, FlatAddr::new(1, 1), true).unwrap();
    st.comtrees.add_comtree(ComtreeId(6), FlatAddr::new(1, 1), true).unwrap();

    let host = FlatAddr::new(1, 10);
    let me = FlatAddr::new(1, 1);
    net.nodes[core].fwd.receive(LinkId(1), signal(&join(1, 60), C5, host, me, true).encode().freeze());
    let second = ControlPacket::request(ControlType::Join, 2)
        .with_int(AttrCode::Comtree, 6)
        .with_int(AttrCode::Rate, 50);
    net.nodes[core]
        .fwd
        .receive(LinkId(1), signal(&second, ComtreeId(6), host, me, true).encode().freeze());
    net.pump(Instant::now());

    let replies = control_of(&net.take_outside(core, 1));
    assert_eq!(replies.len(), 2);
    assert_eq!((replies[0].seq, replies[0].mode), (1, Mode::PosReply));
    assert_eq!((replies[1].seq, replies[1].mode), (2, Mode::NegReply));
    assert_eq!(st.links.allocated(LinkId(1)).unwrap(), 60);
    assert!(!st.comtrees.is_member(ComtreeId(6), LinkId(1)));
}

#[test]
fn same_comtree_children_cannot_overcommit_shared_link() {
    const A: u16 = 1;
    let mut net = Net::default();
    let r = net.add(Node::new(FlatAddr::new(2, 1), EngineConfig::default()));
    let st = net.nodes[r].state().clone();
    net.nodes[r].link(A, FlatAddr::new(1, 1), 100);
    net.nodes[r].link(2, FlatAddr::new(2, 10), 100);
    net.nodes[r].link(3, FlatAddr::new(2, 11), 100);
    st.comtrees.add_comtree(C5, FlatAddr::new(1, 1), false).unwrap();
    st.add_comtree_link(C5, LinkId(A), Attach::Upstream, MemberOrigin::Configured, 0)
        .unwrap();

    // Each child's rate is also carried on the shared link toward the core.
    st.add_comtree_link(C5, LinkId(2), Attach::Below(None), MemberOrigin::Configured, 60)
        .unwrap();
    st.links.reserve_rate(LinkId(A), C5, 60).unwrap();
    st.add_comtree_link(C5, LinkId(3), Attach::Below(None), MemberOrigin::Configured, 50)
        .unwrap();
    let err = st.links.reserve_rate(LinkId(A), C5, 50).unwrap_err();

    assert_eq!(
        err,
        RouterError::AdmissionDenied {
            link: LinkId(A),
            requested: 50,
            available: 40
        }
    );
    assert_eq!(st.links.allocated(LinkId(A)).unwrap(), 60);
    assert_eq!(st.links.reservation(LinkId(A), C5), 60);
}

// ─── Scenario: join through two routers ────────────────────────────────────

#[test]
fn join_propagates_to_core_and_data_flows_back() {
    let mut net = Net::default();
    let core_addr = FlatAddr::new(1, 1);
    let edge_addr = FlatAddr::new(2, 1);
    let host = FlatAddr::new(2, 10);
    let core = net.add(Node::new(core_addr, EngineConfig::default()));
    let edge = net.add(Node::new(edge_addr, EngineConfig::default()));

    net.nodes[core].link(1, edge_addr, 1000);
    net.nodes[core].link(2, FlatAddr::new(1, 10), 1000);
    net.nodes[edge].link(1, core_addr, 1000);
    net.nodes[edge].link(2, host, 1000);
    net.wire((core, 1), (edge, 1));

    let core_st = net.nodes[core].state().clone();
    let edge_st = net.nodes[edge].state().clone();
    core_st.comtrees.add_comtree(C5, core_addr, true).unwrap();
    core_st
        .add_comtree_link(C5, LinkId(2), Attach::Below(None), MemberOrigin::Configured, 0)
        .unwrap();
    edge_st.comtrees.add_comtree(C5, core_addr, false).unwrap();

    let pkt = signal(&join(7, 100), C5, host, edge_addr, true);
    assert_eq!(net.nodes[edge].fwd.receive(LinkId(2), pkt.encode().freeze()), Disposition::Control);
    net.pump(Instant::now());

    let replies = control_of(&net.take_outside(edge, 2));
    assert_eq!(replies.len(), 1);
    assert_eq!((replies[0].seq, replies[0].mode), (7, Mode::PosReply));
    assert!(core_st.comtrees.is_member(C5, LinkId(1)));
    assert_eq!(core_st.links.reservation(LinkId(1), C5), 100);
    assert_eq!(edge_st.comtrees.get(C5).unwrap().upstream, Some(LinkId(1)));

    // Data entering at the core reaches the host behind the edge router.
    let d = data(C5, FlatAddr::new(1, 10), GROUP, b"hello");
    net.nodes[core].fwd.receive(LinkId(2), d);
    net.pump(Instant::now());
    let delivered = net.take_outside(edge, 2);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, &b"hello"[..]);
}

// ─── Scenario: join with no reply ──────────────────────────────────────────

#[test]
fn join_timeout_is_reported_once() {
    let mut net = Net::default();
    let me = FlatAddr::new(2, 1);
    let host = FlatAddr::new(2, 10);
    let r = net.add(Node::new(
        me,
        EngineConfig {
            retry_timeout: Duration::from_millis(100),
            max_attempts: 3,
            ..Default::default()
        },
    ));
    // Link 1 leads to a silent core; it is unwired so requests vanish.
    net.nodes[r].link(1, FlatAddr::new(1, 1), 1000);
    net.nodes[r].link(2, host, 1000);
    let st = net.nodes[r].state().clone();
    st.comtrees.add_comtree(C5, FlatAddr::new(1, 1), false).unwrap();

    let t0 = Instant::now();
    net.nodes[r]
        .fwd
        .receive(LinkId(2), signal(&join(3, 10), C5, host, me, true).encode().freeze());
    net.pump(t0);
    for step in 1..=10u64 {
        net.pump(t0 + Duration::from_millis(100 * step));
    }

    let upstream = control_of(&net.take_outside(r, 1));
    assert_eq!(upstream.len(), 3);
    assert!(upstream.iter().all(|c| c.ctype == ControlType::Join));
    assert!(upstream.windows(2).all(|w| w[0].seq == w[1].seq));

    let replies = control_of(&net.take_outside(r, 2));
    assert_eq!(replies.len(), 1);
    assert_eq!((replies[0].seq, replies[0].mode), (3, Mode::NegReply));

    assert!(st.comtrees.get(C5).unwrap().members.is_empty());
    assert_eq!(st.links.allocated(LinkId(1)).unwrap(), 0);
    assert_eq!(st.links.allocated(LinkId(2)).unwrap(), 0);
    let snap = st.stats.snapshot();
    assert_eq!(snap.retransmissions, 2);
    assert_eq!(snap.requests_failed, 1);
    assert_eq!(net.nodes[r].ctl.pending_requests(), 0);
}

// ─── Scenario: join then leave ─────────────────────────────────────────────

#[test]
fn join_then_leave_restores_membership_and_routes() {
    let mut net = Net::default();
    let me = FlatAddr::new(2, 1);
    let host = FlatAddr::new(2, 10);
    let r = net.add(Node::new(me, EngineConfig::default()));
    net.nodes[r].link(1, FlatAddr::new(1, 1), 1000);
    net.nodes[r].link(2, FlatAddr::new(2, 9), 1000);
    net.nodes[r].link(3, host, 1000);
    let st = net.nodes[r].state().clone();
    st.comtrees.add_comtree(C5, FlatAddr::new(1, 1), false).unwrap();
    st.add_comtree_link(C5, LinkId(1), Attach::Upstream, MemberOrigin::Configured, 50)
        .unwrap();
    st.add_comtree_link(C5, LinkId(2), Attach::Below(None), MemberOrigin::Configured, 50)
        .unwrap();

    let before = st.comtrees.get(C5).unwrap();
    let routes_before = st.comtrees.lookup_route(C5, LinkId(2)).unwrap().to_vec();
    let alloc_before: Vec<u32> = (1..=3).map(|l| st.links.allocated(LinkId(l)).unwrap()).collect();

    net.nodes[r]
        .fwd
        .receive(LinkId(3), signal(&join(1, 25), C5, host, me, true).encode().freeze());
    net.pump(Instant::now());
    assert!(st.comtrees.is_member(C5, LinkId(3)));
    assert_eq!(st.comtrees.lookup_route(C5, LinkId(2)).unwrap().len(), 2);

    net.nodes[r]
        .fwd
        .receive(LinkId(3), signal(&leave(2), C5, host, me, true).encode().freeze());
    net.pump(Instant::now());

    assert_eq!(st.comtrees.get(C5).unwrap(), before);
    assert_eq!(st.comtrees.lookup_route(C5, LinkId(2)).unwrap().to_vec(), routes_before);
    let alloc_after: Vec<u32> = (1..=3).map(|l| st.links.allocated(LinkId(l)).unwrap()).collect();
    assert_eq!(alloc_after, alloc_before);
    // Configured upstream stays, so nothing is sent toward the core.
    assert!(control_of(&net.take_outside(r, 1)).is_empty());
    let replies = control_of(&net.take_outside(r, 3));
    assert_eq!(replies.iter().map(|c| c.mode).collect::<Vec<_>>(), vec![Mode::PosReply; 2]);
}

#[test]
fn leave_of_unknown_comtree_is_refused() {
    let mut net = Net::default();
    let me = FlatAddr::new(2, 1);
    let r = net.add(Node::new(me, EngineConfig::default()));
    net.nodes[r].link(1, FlatAddr::new(2, 10), 1000);
    net.nodes[r]
        .fwd
        .receive(LinkId(1), signal(&leave(4), C5, FlatAddr::new(2, 10), me, true).encode().freeze());
    net.pump(Instant::now());
    let replies = control_of(&net.take_outside(r, 1));
    assert_eq!(replies[0].mode, Mode::NegReply);
    assert!(replies[0]
        .err_msg()
        .unwrap()
        .contains(&RouterError::UnknownComtree(C5).to_string()));
}

// ─── Scenario: route learning across two routers ──────────────────────────

#[test]
fn unicast_route_is_learned_from_far_router() {
    let mut net = Net::default();
    let core_addr = FlatAddr::new(1, 1);
    let edge_addr = FlatAddr::new(2, 1);
    let sender = FlatAddr::new(1, 10);
    let receiver = FlatAddr::new(2, 10);
    let core = net.add(Node::new(core_addr, EngineConfig::default()));
    let edge = net.add(Node::new(edge_addr, EngineConfig::default()));

    let core_st = net.nodes[core].state().clone();
    let edge_st = net.nodes[edge].state().clone();
    net.nodes[core].link(1, edge_addr, 1000);
    core_st
        .add_link(LinkEntry::new(LinkId(2), sender, 1000).with_peer_type(PeerType::Client))
        .unwrap();
    net.nodes[edge].link(1, core_addr, 1000);
    edge_st
        .add_link(LinkEntry::new(LinkId(2), receiver, 1000).with_peer_type(PeerType::Client))
        .unwrap();
    net.wire((core, 1), (edge, 1));

    core_st.comtrees.add_comtree(C5, core_addr, true).unwrap();
    edge_st.comtrees.add_comtree(C5, core_addr, false).unwrap();
    for link in [1, 2] {
        core_st
            .add_comtree_link(C5, LinkId(link), Attach::Below(None), MemberOrigin::Configured, 0)
            .unwrap();
    }
    edge_st
        .add_comtree_link(C5, LinkId(1), Attach::Upstream, MemberOrigin::Configured, 0)
        .unwrap();
    edge_st
        .add_comtree_link(C5, LinkId(2), Attach::Below(None), MemberOrigin::Configured, 0)
        .unwrap();

    assert_eq!(
        net.nodes[core].fwd.receive(LinkId(2), data(C5, sender, receiver, b"one")),
        Disposition::Forwarded(1)
    );
    net.pump(Instant::now());

    let delivered = net.take_outside(edge, 2);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].header.flags & FLAG_ROUTE_REQUEST, 0);
    assert_eq!(
        core_st.routes.lookup(C5, receiver, core_addr.zip()),
        Some(Route::Unicast(LinkId(1)))
    );
    // the reply ends at the sender's router
    assert!(net.take_outside(core, 2).is_empty());

    net.nodes[core].fwd.receive(LinkId(2), data(C5, sender, receiver, b"two"));
    net.pump(Instant::now());
    let delivered = net.take_outside(edge, 2);
    assert_eq!(delivered[0].payload, &b"two"[..]);
    assert_eq!(core_st.store.in_use(), 0);
    assert_eq!(edge_st.store.in_use(), 0);
}
