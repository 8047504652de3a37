//! Per-packet processing cost of the forwarding path.
//!
//! - PacketHeader / Packet decode
//! - ForwardingEngine::receive with fan-out 1, 4 and 16
//! - Full receive + transmit cycle, pool returned to empty each iteration
//! - Control packet decode
//!
//! Run with: cargo bench --package comtree-core

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;

use comtree_core::comtree::MemberOrigin;
use comtree_core::control::{AttrCode, ControlPacket, ControlType};
use comtree_core::engine::Inbound;
use comtree_core::forward::ForwardingEngine;
use comtree_core::link::LinkEntry;
use comtree_core::state::{Attach, RouterLimits, RouterState};
use comtree_core::stats::RouterStats;
use comtree_core::wire::{Packet, PacketHeader, PacketType};
use comtree_core::{ComtreeId, FlatAddr, LinkId};

const C: ComtreeId = ComtreeId(5);
const GROUP: FlatAddr = FlatAddr(0x8000_0005);

fn router(members: u16) -> (ForwardingEngine, Receiver<Inbound>) {
    let me = FlatAddr::new(1, 1);
    let state = Arc::new(RouterState::new(
        me,
        RouterLimits::default(),
        Arc::new(RouterStats::new()),
    ));
    state.comtrees.add_comtree(C, me, true).unwrap();
    for id in 1..=members {
        state
            .add_link(LinkEntry::new(LinkId(id), FlatAddr::new(2, id), 1_000_000))
            .unwrap();
        state
            .add_comtree_link(C, LinkId(id), Attach::Below(None), MemberOrigin::Configured, 1000)
            .unwrap();
    }
    let (tx, rx) = bounded(1024);
    (ForwardingEngine::new(state, tx), rx)
}

fn datagram(size: usize) -> Bytes {
    let hdr = PacketHeader::new(
        PacketType::Data,
        C,
        FlatAddr::new(2, 1),
        GROUP,
        size as u16,
    );
    Packet::new(hdr, Bytes::from(vec![0xAB; size])).encode().freeze()
}

// ─── Decode ──────────────────────────────────────────────────────────────

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let hdr_bytes = datagram(0);
    group.bench_function("header", |b| {
        b.iter(|| {
            let mut buf = black_box(hdr_bytes.clone());
            black_box(PacketHeader::decode(&mut buf).unwrap());
        });
    });
    for size in [64usize, 512, 1400] {
        let dgram = datagram(size);
        group.throughput(Throughput::Bytes(dgram.len() as u64));
        group.bench_with_input(BenchmarkId::new("packet", size), &dgram, |b, d| {
            b.iter(|| black_box(Packet::decode(d.clone()).unwrap()));
        });
    }
    let join = ControlPacket::request(ControlType::Join, 123_456)
        .with_int(AttrCode::Comtree, C.0 as u64)
        .with_int(AttrCode::Rate, 2000);
    let mut encoded = BytesMut::new();
    join.encode(&mut encoded);
    let encoded = encoded.freeze();
    group.bench_function("control", |b| {
        b.iter(|| black_box(ControlPacket::decode(&mut encoded.clone()).unwrap()));
    });
    group.finish();
}

// ─── Fan-out ─────────────────────────────────────────────────────────────

fn bench_receive_transmit(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive_transmit");
    for members in [2u16, 5, 17] {
        let (fwd, _rx) = router(members);
        let dgram = datagram(1200);
        group.throughput(Throughput::Elements((members - 1) as u64));
        group.bench_with_input(BenchmarkId::new("fanout", members - 1), &dgram, |b, d| {
            b.iter(|| {
                black_box(fwd.receive(LinkId(1), d.clone()));
                for l in 2..=members {
                    black_box(fwd.transmit_next(LinkId(l)));
                }
            });
        });
        assert_eq!(fwd.state().store.in_use(), 0);
    }
    group.finish();
}

fn bench_drop_path(c: &mut Criterion) {
    let (fwd, _rx) = router(2);
    let stray = {
        let hdr = PacketHeader::new(PacketType::Data, ComtreeId(99), FlatAddr::new(2, 1), GROUP, 64);
        Packet::new(hdr, Bytes::from(vec![0u8; 64])).encode().freeze()
    };
    c.bench_function("drop_unknown_comtree", |b| {
        b.iter(|| black_box(fwd.receive(LinkId(1), stray.clone())));
    });
}

criterion_group!(benches, bench_decode, bench_receive_transmit, bench_drop_path);
criterion_main!(benches);
