//! # Router Runtime
//!
//! Threads around the core engines:
//!
//! - `comtree-rx`: reads the UDP socket, maps the source endpoint to a link
//!   and runs the forwarding decision.
//! - `comtree-ctl`: owns the [`ControlEngine`]; wakes on inbound signalling
//!   or the next retransmission deadline, and keeps one transmit thread per
//!   link in step with the link table.
//! - `comtree-tx-<link>`: drains one link's queues as its pacer allows.
//!
//! Dropping the runtime shuts every thread down and joins it.

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use quanta::Instant;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use comtree_core::engine::{ControlEngine, Inbound};
use comtree_core::forward::ForwardingEngine;
use comtree_core::state::RouterState;
use comtree_core::stats::{DropReason, RouterStats, StatsSnapshot};
use comtree_core::LinkId;

use crate::config::{bootstrap, RouterConfig};
use crate::transport::{UdpTransport, MAX_DATAGRAM};

/// Socket read timeout; bounds how long the reader takes to see shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest the control thread sleeps with nothing to do.
const CONTROL_IDLE: Duration = Duration::from_millis(50);

/// Transmit thread sleep when its link has nothing ready.
const TX_IDLE: Duration = Duration::from_micros(200);

/// Datagrams sent per transmit pass before re-checking shutdown.
const TX_BATCH: usize = 64;

// ─── Runtime ─────────────────────────────────────────────────────────────────

pub struct RouterRuntime {
    state: Arc<RouterState>,
    transport: Arc<UdpTransport>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl RouterRuntime {
    /// Load `config`, bind the socket and start the worker threads.
    pub fn start(config: RouterConfig) -> Result<Self> {
        let stats = Arc::new(RouterStats::new());
        let state = Arc::new(RouterState::new(config.address, config.limits, stats));
        bootstrap(&state, &config)?;

        let transport = Arc::new(UdpTransport::bind(config.bind, POLL_INTERVAL)?);
        let local_addr = transport.local_addr().context("reading bound address")?;
        let running = Arc::new(AtomicBool::new(true));

        let (control_tx, control_rx) = bounded(config.engine.work_queue_capacity);
        let forwarder = Arc::new(ForwardingEngine::new(state.clone(), control_tx));
        let engine = ControlEngine::new(state.clone(), config.engine).with_inbound(control_rx.clone());

        let mut handles = Vec::with_capacity(2);
        {
            let transport = transport.clone();
            let forwarder = forwarder.clone();
            let running = running.clone();
            handles.push(
                thread::Builder::new()
                    .name("comtree-rx".into())
                    .spawn(move || receive_loop(&transport, &forwarder, &running))
                    .context("spawning receive thread")?,
            );
        }
        {
            let transmitters = Transmitters::new(forwarder, transport.clone(), running.clone());
            let flag = running.clone();
            let interval = config.stats_interval;
            let spawned = thread::Builder::new()
                .name("comtree-ctl".into())
                .spawn(move || control_loop(engine, control_rx, transmitters, interval, &flag))
                .context("spawning control thread");
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    running.store(false, Ordering::Relaxed);
                    for h in handles.drain(..) {
                        let _ = h.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            address = %config.address,
            bind = %local_addr,
            links = state.links.len(),
            comtrees = state.comtrees.len(),
            "router running"
        );

        Ok(RouterRuntime {
            state,
            transport,
            local_addr,
            running,
            handles,
        })
    }

    pub fn state(&self) -> &Arc<RouterState> {
        &self.state
    }

    /// Address the socket is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Socket send failures so far.
    pub fn send_errors(&self) -> u64 {
        self.transport.send_errors()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop and join every thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                warn!("router thread panicked");
            }
        }
    }
}

impl Drop for RouterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Receive ─────────────────────────────────────────────────────────────────

fn receive_loop(transport: &UdpTransport, forwarder: &ForwardingEngine, running: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let state = forwarder.state();
    while running.load(Ordering::Relaxed) {
        match transport.recv(&mut buf) {
            Ok(Some((n, from))) => match UdpTransport::ingress_link(&state.links, from) {
                Some(link) => {
                    forwarder.receive(link, Bytes::copy_from_slice(&buf[..n]));
                }
                None => {
                    state.stats.record_drop(DropReason::UnknownPeer);
                    debug!(%from, len = n, "datagram from unknown endpoint");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "receive failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("receive thread stopped");
}

// ─── Transmit ────────────────────────────────────────────────────────────────

struct Transmitter {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// One transmit thread per link in the link table.
struct Transmitters {
    forwarder: Arc<ForwardingEngine>,
    transport: Arc<UdpTransport>,
    running: Arc<AtomicBool>,
    workers: HashMap<LinkId, Transmitter>,
}

impl Transmitters {
    fn new(
        forwarder: Arc<ForwardingEngine>,
        transport: Arc<UdpTransport>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Transmitters {
            forwarder,
            transport,
            running,
            workers: HashMap::new(),
        }
    }

    /// Start threads for new links and stop those of removed links.
    fn reconcile(&mut self) {
        let live: HashSet<LinkId> = self.forwarder.state().links.ids().into_iter().collect();
        if live.len() == self.workers.len() && live.iter().all(|l| self.workers.contains_key(l)) {
            return;
        }

        let gone: Vec<LinkId> = self
            .workers
            .keys()
            .copied()
            .filter(|l| !live.contains(l))
            .collect();
        for link in gone {
            if let Some(w) = self.workers.remove(&link) {
                w.stop.store(true, Ordering::Relaxed);
                let _ = w.handle.join();
                debug!(link = %link, "transmit thread stopped");
            }
        }

        for link in live {
            if self.workers.contains_key(&link) {
                continue;
            }
            let stop = Arc::new(AtomicBool::new(false));
            let forwarder = self.forwarder.clone();
            let transport = self.transport.clone();
            let running = self.running.clone();
            let stop_flag = stop.clone();
            let spawned = thread::Builder::new()
                .name(format!("comtree-tx-{}", link.0))
                .spawn(move || transmit_loop(link, &forwarder, &transport, &running, &stop_flag));
            match spawned {
                Ok(handle) => {
                    self.workers.insert(link, Transmitter { stop, handle });
                }
                Err(e) => warn!(link = %link, error = %e, "could not start transmit thread"),
            }
        }
    }

    fn stop_all(&mut self) {
        for (_, w) in self.workers.drain() {
            w.stop.store(true, Ordering::Relaxed);
            let _ = w.handle.join();
        }
    }
}

fn transmit_loop(
    link: LinkId,
    forwarder: &ForwardingEngine,
    transport: &UdpTransport,
    running: &AtomicBool,
    stop: &AtomicBool,
) {
    let links = &forwarder.state().links;
    while running.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        let mut sent = 0;
        while sent < TX_BATCH {
            let Some(dgram) = forwarder.transmit_ready(link, now) else {
                break;
            };
            transport.send_on(links, link, &dgram);
            sent += 1;
        }
        if sent == 0 {
            thread::sleep(TX_IDLE);
        }
    }
}

// ─── Control ─────────────────────────────────────────────────────────────────

fn control_loop(
    mut engine: ControlEngine,
    inbound: Receiver<Inbound>,
    mut transmitters: Transmitters,
    stats_interval: Duration,
    running: &AtomicBool,
) {
    transmitters.reconcile();
    let mut last_stats = Instant::now();

    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let wait = engine
            .next_deadline()
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(CONTROL_IDLE)
            .min(CONTROL_IDLE);
        match inbound.recv_timeout(wait) {
            Ok(Inbound { link, packet }) => {
                if let Err(err) = engine.submit(link, packet) {
                    debug!(link = %link, error = %err, "signalling refused");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        engine.poll(Instant::now());
        transmitters.reconcile();

        if last_stats.elapsed() >= stats_interval {
            let s = engine.state().stats.snapshot();
            info!(
                received = s.received,
                forwarded = s.forwarded,
                transmitted = s.transmitted,
                control = s.control_handled,
                dropped = s.drops.total(),
                pending = engine.pending_requests(),
                pool_in_use = engine.state().store.in_use(),
                "router stats"
            );
            last_stats = Instant::now();
        }
    }

    transmitters.stop_all();
    debug!("control thread stopped");
}
