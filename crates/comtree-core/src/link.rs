//! # Link Table
//!
//! Physical links to neighbouring routers, clients and controllers, together
//! with the per-comtree bandwidth reservations carried on each link.
//!
//! Admission control lives here: a reservation is only committed when the
//! link's total allocation stays within its capacity. All mutations take the
//! table write lock, so a check and its commit are never split.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr, LinkId};

// ─── Peer Type ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    Client,
    #[default]
    Router,
    Controller,
}

// ─── Link Entry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkEntry {
    pub id: LinkId,
    pub peer_addr: FlatAddr,
    pub peer_type: PeerType,
    /// UDP endpoint of the peer, if known.
    pub endpoint: Option<SocketAddr>,
    /// Physical capacity in kb/s.
    pub capacity: u32,
    /// Reserved rate per comtree in kb/s.
    pub reservations: HashMap<ComtreeId, u32>,
}

impl LinkEntry {
    pub fn new(id: LinkId, peer_addr: FlatAddr, capacity: u32) -> Self {
        LinkEntry {
            id,
            peer_addr,
            peer_type: PeerType::default(),
            endpoint: None,
            capacity,
            reservations: HashMap::new(),
        }
    }

    pub fn with_peer_type(mut self, peer_type: PeerType) -> Self {
        self.peer_type = peer_type;
        self
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sum of all reservations on this link.
    pub fn allocated(&self) -> u32 {
        self.reservations.values().copied().sum()
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated())
    }

    pub fn reservation(&self, comtree: ComtreeId) -> u32 {
        self.reservations.get(&comtree).copied().unwrap_or(0)
    }
}

// ─── Link Table ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LinkTable {
    links: RwLock<HashMap<LinkId, LinkEntry>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LinkId, LinkEntry>> {
        self.links.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LinkId, LinkEntry>> {
        self.links.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a link. Ids and peer endpoints must be unique.
    pub fn add_link(&self, mut entry: LinkEntry) -> Result<()> {
        let mut links = self.write();
        if links.contains_key(&entry.id) {
            return Err(RouterError::Duplicate(format!("link {}", entry.id)));
        }
        if let Some(ep) = entry.endpoint {
            if links.values().any(|l| l.endpoint == Some(ep)) {
                return Err(RouterError::Duplicate(format!("endpoint {ep}")));
            }
        }
        entry.reservations.clear();
        links.insert(entry.id, entry);
        Ok(())
    }

    /// Remove a link that carries no reservations.
    pub fn remove_link(&self, id: LinkId) -> Result<LinkEntry> {
        let mut links = self.write();
        let entry = links.get(&id).ok_or(RouterError::UnknownLink(id))?;
        if entry.allocated() > 0 {
            return Err(RouterError::LinkInUse(id));
        }
        links.remove(&id).ok_or(RouterError::UnknownLink(id))
    }

    /// Change a link's capacity. The new capacity may not fall below what is
    /// already allocated.
    pub fn modify_link(&self, id: LinkId, capacity: u32) -> Result<()> {
        let mut links = self.write();
        let entry = links.get_mut(&id).ok_or(RouterError::UnknownLink(id))?;
        let allocated = entry.allocated();
        if capacity < allocated {
            return Err(RouterError::AdmissionDenied {
                link: id,
                requested: allocated,
                available: capacity,
            });
        }
        entry.capacity = capacity;
        Ok(())
    }

    /// Add `amount` kb/s to the reservation of `comtree` on `link`.
    pub fn reserve_rate(&self, link: LinkId, comtree: ComtreeId, amount: u32) -> Result<()> {
        let mut links = self.write();
        let entry = links.get_mut(&link).ok_or(RouterError::UnknownLink(link))?;
        let available = entry.available();
        if amount > available {
            return Err(RouterError::AdmissionDenied {
                link,
                requested: amount,
                available,
            });
        }
        *entry.reservations.entry(comtree).or_insert(0) += amount;
        Ok(())
    }

    /// Replace the reservation of `comtree` on `link` with `new_amount`.
    pub fn resize_rate(&self, link: LinkId, comtree: ComtreeId, new_amount: u32) -> Result<()> {
        let mut links = self.write();
        let entry = links.get_mut(&link).ok_or(RouterError::UnknownLink(link))?;
        let current = entry.reservation(comtree);
        let available = entry.available() + current;
        if new_amount > available {
            return Err(RouterError::AdmissionDenied {
                link,
                requested: new_amount,
                available,
            });
        }
        if new_amount == 0 {
            entry.reservations.remove(&comtree);
        } else {
            entry.reservations.insert(comtree, new_amount);
        }
        Ok(())
    }

    /// Drop the whole reservation of `comtree` on `link`, returning the
    /// amount released.
    pub fn release_rate(&self, link: LinkId, comtree: ComtreeId) -> Result<u32> {
        let mut links = self.write();
        let entry = links.get_mut(&link).ok_or(RouterError::UnknownLink(link))?;
        Ok(entry.reservations.remove(&comtree).unwrap_or(0))
    }

    pub fn get(&self, id: LinkId) -> Result<LinkEntry> {
        self.read().get(&id).cloned().ok_or(RouterError::UnknownLink(id))
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn allocated(&self, id: LinkId) -> Result<u32> {
        self.read()
            .get(&id)
            .map(LinkEntry::allocated)
            .ok_or(RouterError::UnknownLink(id))
    }

    pub fn capacity(&self, id: LinkId) -> Result<u32> {
        self.read()
            .get(&id)
            .map(|l| l.capacity)
            .ok_or(RouterError::UnknownLink(id))
    }

    pub fn reservation(&self, id: LinkId, comtree: ComtreeId) -> u32 {
        self.read()
            .get(&id)
            .map(|l| l.reservation(comtree))
            .unwrap_or(0)
    }

    pub fn peer_addr(&self, id: LinkId) -> Option<FlatAddr> {
        self.read().get(&id).map(|l| l.peer_addr)
    }

    /// Peer address and type, for per-packet checks.
    pub fn peer(&self, id: LinkId) -> Option<(FlatAddr, PeerType)> {
        self.read().get(&id).map(|l| (l.peer_addr, l.peer_type))
    }

    pub fn endpoint(&self, id: LinkId) -> Option<SocketAddr> {
        self.read().get(&id).and_then(|l| l.endpoint)
    }

    /// Reverse lookup from a peer's UDP endpoint to the link reaching it.
    pub fn link_for_endpoint(&self, endpoint: SocketAddr) -> Option<LinkId> {
        self.read()
            .values()
            .find(|l| l.endpoint == Some(endpoint))
            .map(|l| l.id)
    }

    /// Link whose peer has the given flat address.
    pub fn link_for_peer(&self, addr: FlatAddr) -> Option<LinkId> {
        self.read()
            .values()
            .find(|l| l.peer_addr == addr)
            .map(|l| l.id)
    }

    pub fn ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
