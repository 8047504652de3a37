//! # UDP Transport
//!
//! One UDP socket carries every link. A datagram's source endpoint selects
//! its ingress link; an outgoing datagram goes to the endpoint recorded for
//! its egress link.

use anyhow::{Context, Result};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use comtree_core::link::LinkTable;
use comtree_core::LinkId;

/// Largest datagram the receive path accepts.
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    send_errors: AtomicU64,
    unroutable: AtomicU64,
}

impl UdpTransport {
    /// Bind `addr`. Receives time out after `poll_interval` so reader loops
    /// can notice shutdown.
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("binding {addr}"))?;
        socket
            .set_read_timeout(Some(poll_interval))
            .context("setting socket read timeout")?;
        Ok(UdpTransport {
            socket,
            send_errors: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for one datagram. `Ok(None)` when the poll interval passed
    /// without traffic.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(r) => Ok(Some(r)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Ingress link of a datagram from `from`.
    pub fn ingress_link(links: &LinkTable, from: SocketAddr) -> Option<LinkId> {
        links.link_for_endpoint(from)
    }

    /// Send `datagram` on `link`. Returns false when the link has no endpoint
    /// or the socket refused the datagram.
    pub fn send_on(&self, links: &LinkTable, link: LinkId, datagram: &[u8]) -> bool {
        let Some(endpoint) = links.endpoint(link) else {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(link = %link, "link has no endpoint, datagram discarded");
            return false;
        };
        match self.socket.send_to(datagram, endpoint) {
            Ok(_) => true,
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(link = %link, %endpoint, error = %e, "send failed");
                false
            }
        }
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Datagrams discarded because their link had no endpoint.
    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }
}
