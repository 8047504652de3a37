//! # Integration tests: routers over loopback UDP
//!
//! Two router runtimes and plain UDP sockets standing in for hosts, all on
//! 127.0.0.1 with OS-assigned ports.

use bytes::Bytes;
use comtree_core::comtree::MemberOrigin;
use comtree_core::control::{AttrCode, ControlPacket, ControlType, Mode};
use comtree_core::engine::signal;
use comtree_core::link::{LinkEntry, PeerType};
use comtree_core::state::Attach;
use comtree_core::wire::{Packet, PacketHeader, PacketType};
use comtree_core::{ComtreeId, FlatAddr, LinkId};
use comtree_router::config::ComtreeConfig;
use comtree_router::{RouterConfig, RouterRuntime};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

const C5: ComtreeId = ComtreeId(5);
const CORE: FlatAddr = FlatAddr(0x0001_0001);
const EDGE: FlatAddr = FlatAddr(0x0002_0001);

// ─── Helpers ────────────────────────────────────────────────────────────────

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn host_socket() -> UdpSocket {
    let s = UdpSocket::bind(loopback()).unwrap();
    s.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    s
}

fn router(address: FlatAddr, is_core: bool) -> RouterRuntime {
    let mut config = RouterConfig::new(address, loopback());
    config.comtrees.push(ComtreeConfig {
        id: C5,
        core: CORE,
        is_core,
        core_link: None,
        members: Vec::new(),
    });
    RouterRuntime::start(config).unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// First decodable packet on `sock` matching `pred`, within two seconds.
fn recv_matching(sock: &UdpSocket, pred: impl Fn(&Packet) -> bool) -> Option<Packet> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut buf = [0u8; 2048];
    while Instant::now() < deadline {
        if let Ok((n, _)) = sock.recv_from(&mut buf) {
            if let Ok(pkt) = Packet::decode(Bytes::copy_from_slice(&buf[..n])) {
                if pred(&pkt) {
                    return Some(pkt);
                }
            }
        }
    }
    None
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[test]
fn join_over_two_routers_then_data_reaches_host() {
    let mut core = router(CORE, true);
    let mut edge = router(EDGE, false);
    let host = host_socket();
    let sender = host_socket();
    let host_addr = FlatAddr::new(2, 10);
    let sender_addr = FlatAddr::new(1, 10);

    core.state()
        .add_link(LinkEntry::new(LinkId(1), EDGE, 10_000).with_endpoint(edge.local_addr()))
        .unwrap();
    core.state()
        .add_link(
            LinkEntry::new(LinkId(2), sender_addr, 10_000)
                .with_peer_type(PeerType::Client)
                .with_endpoint(sender.local_addr().unwrap()),
        )
        .unwrap();
    core.state()
        .add_comtree_link(C5, LinkId(2), Attach::Below(None), MemberOrigin::Configured, 0)
        .unwrap();
    edge.state()
        .add_link(LinkEntry::new(LinkId(1), CORE, 10_000).with_endpoint(core.local_addr()))
        .unwrap();
    edge.state()
        .add_link(
            LinkEntry::new(LinkId(2), host_addr, 10_000)
                .with_peer_type(PeerType::Client)
                .with_endpoint(host.local_addr().unwrap()),
        )
        .unwrap();

    let join = ControlPacket::request(ControlType::Join, 42)
        .with_int(AttrCode::Comtree, C5.0 as u64)
        .with_int(AttrCode::Rate, 500);
    let dgram = signal(&join, C5, host_addr, EDGE, true).encode();
    host.send_to(&dgram, edge.local_addr()).unwrap();

    let reply = recv_matching(&host, |p| p.header.packet_type.is_control())
        .expect("no reply to join");
    let ctl = ControlPacket::from_packet(&reply).unwrap();
    assert_eq!((ctl.seq, ctl.mode), (42, Mode::PosReply));
    assert_eq!(reply.header.dst, host_addr);
    assert!(core.state().comtrees.is_member(C5, LinkId(1)));
    assert_eq!(edge.state().links.reservation(LinkId(1), C5), 500);

    let hdr = PacketHeader::new(PacketType::Data, C5, sender_addr, FlatAddr(0x8000_0005), 5);
    let data = Packet::new(hdr, Bytes::from_static(b"hello")).encode();
    sender.send_to(&data, core.local_addr()).unwrap();

    let got = recv_matching(&host, |p| p.header.packet_type == PacketType::Data)
        .expect("data did not arrive");
    assert_eq!(&got.payload[..], b"hello");
    assert_eq!(got.header.src, sender_addr);

    core.shutdown();
    edge.shutdown();
    assert!(!core.is_running());
    assert!(core.stats().forwarded >= 1);
    assert!(edge.stats().control_handled >= 2);
    assert_eq!(edge.state().store.in_use(), 0);
}

#[test]
fn unknown_endpoint_is_counted() {
    let rt = router(CORE, true);
    let stray = host_socket();
    let hdr = PacketHeader::new(PacketType::Data, C5, FlatAddr::new(9, 9), CORE, 0);
    stray
        .send_to(&Packet::new(hdr, Bytes::new()).encode(), rt.local_addr())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        rt.stats().drops.unknown_peer == 1
    }));
    assert_eq!(rt.stats().received, 0);
}

#[test]
fn link_added_at_runtime_gets_transmitter() {
    let rt = router(CORE, true);
    let host = host_socket();
    let host_addr = FlatAddr::new(1, 20);
    rt.state()
        .add_link(
            LinkEntry::new(LinkId(3), host_addr, 1000).with_endpoint(host.local_addr().unwrap()),
        )
        .unwrap();

    let get =
        ControlPacket::request(ControlType::GetComtree, 7).with_int(AttrCode::Comtree, C5.0 as u64);
    let dgram = signal(&get, C5, host_addr, CORE, false).encode();
    host.send_to(&dgram, rt.local_addr()).unwrap();

    let reply = recv_matching(&host, |p| p.header.packet_type.is_control()).expect("no reply");
    let ctl = ControlPacket::from_packet(&reply).unwrap();
    assert_eq!(ctl.mode, Mode::PosReply);
    assert_eq!(ctl.get_int(AttrCode::IsCore), Some(1));
    assert_eq!(ctl.get_int(AttrCode::MemberCount), Some(0));
}

#[test]
fn drop_shuts_down_cleanly() {
    let rt = router(EDGE, false);
    let addr = rt.local_addr();
    drop(rt);
    // The port is free again once every thread is joined.
    assert!(UdpSocket::bind(addr).is_ok());
}
