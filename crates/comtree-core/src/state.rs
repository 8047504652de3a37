//! Shared router state: the tables, packet store, queues and counters that
//! the forwarding path and the control engine both operate on.
//!
//! Composite operations that touch more than one table live here, so the
//! bootstrap loader and the control handlers commit and roll back the same
//! way.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::comtree::{ComtreeInfo, ComtreeTable, MemberOrigin};
use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr, LinkId};
use crate::link::{LinkEntry, LinkTable};
use crate::pool::PacketStore;
use crate::queue::{Discipline, QueueLimits, QueueManager};
use crate::route::RouteTable;
use crate::stats::{DropReason, RouterStats};
use crate::wire::Packet;

/// Sizing for the packet store and output queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterLimits {
    pub pool_capacity: usize,
    pub queue_limits: QueueLimits,
    pub discipline: Discipline,
}

impl Default for RouterLimits {
    fn default() -> Self {
        RouterLimits {
            pool_capacity: 4096,
            queue_limits: QueueLimits::default(),
            discipline: Discipline::default(),
        }
    }
}

/// Where a comtree link attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// As the link toward the core.
    Upstream,
    /// Below the given parent; `None` places it below the upstream link, or
    /// at the router when there is none.
    Below(Option<LinkId>),
}

pub struct RouterState {
    addr: FlatAddr,
    pub store: Arc<PacketStore>,
    pub links: LinkTable,
    pub comtrees: ComtreeTable,
    pub queues: QueueManager,
    pub routes: RouteTable,
    pub stats: Arc<RouterStats>,
}

impl RouterState {
    pub fn new(addr: FlatAddr, limits: RouterLimits, stats: Arc<RouterStats>) -> Self {
        let store = Arc::new(PacketStore::new(limits.pool_capacity));
        RouterState {
            addr,
            queues: QueueManager::new(store.clone(), limits.discipline, limits.queue_limits),
            store,
            links: LinkTable::new(),
            comtrees: ComtreeTable::new(),
            routes: RouteTable::new(),
            stats,
        }
    }

    /// This router's flat address.
    pub fn addr(&self) -> FlatAddr {
        self.addr
    }

    // ─── Links ───────────────────────────────────────────────────────────────

    pub fn add_link(&self, entry: LinkEntry) -> Result<()> {
        let (id, capacity) = (entry.id, entry.capacity);
        self.links.add_link(entry)?;
        self.queues.add_link(id, capacity);
        Ok(())
    }

    /// Remove a link that no comtree uses.
    pub fn remove_link(&self, id: LinkId) -> Result<LinkEntry> {
        if !self.links.contains(id) {
            return Err(RouterError::UnknownLink(id));
        }
        if !self.comtrees.comtrees_on_link(id).is_empty() {
            return Err(RouterError::LinkInUse(id));
        }
        let entry = self.links.remove_link(id)?;
        let dropped = self.queues.remove_link(id);
        if dropped > 0 {
            debug!(link = %id, dropped, "released queued packets of removed link");
        }
        Ok(entry)
    }

    pub fn modify_link(&self, id: LinkId, capacity: u32) -> Result<()> {
        self.links.modify_link(id, capacity)?;
        self.queues.set_capacity(id, capacity)
    }

    // ─── Comtree Links ───────────────────────────────────────────────────────

    /// Reserve `rate` on `link`, attach it to `comtree` and give it a queue.
    /// Nothing is left behind when any step fails.
    pub fn add_comtree_link(
        &self,
        comtree: ComtreeId,
        link: LinkId,
        attach: Attach,
        origin: MemberOrigin,
        rate: u32,
    ) -> Result<()> {
        if !self.links.contains(link) {
            return Err(RouterError::UnknownLink(link));
        }
        if self.comtrees.read(comtree, |e| e.is_member(link))? {
            return Err(RouterError::topology(format!("{link} already in {comtree}")));
        }
        self.links.reserve_rate(link, comtree, rate)?;
        let attached = self.comtrees.update(comtree, |e| match attach {
            Attach::Upstream => {
                e.attach_upstream(link, origin, rate)?;
                e.adopt_orphans();
                Ok(())
            }
            Attach::Below(parent) => {
                let parent = parent.or(e.upstream());
                e.attach(link, parent, origin, rate)
            }
        });
        if let Err(err) = attached {
            if let Err(undo) = self.links.release_rate(link, comtree) {
                warn!(link = %link, comtree = %comtree, error = %undo, "reservation not returned");
            }
            return Err(err);
        }
        self.queues.configure_queue(link, comtree, rate)
    }

    /// Give back the reservation, queue and routes a departed member held.
    pub fn release_member(&self, comtree: ComtreeId, link: LinkId) {
        if let Err(err) = self.links.release_rate(link, comtree) {
            warn!(link = %link, comtree = %comtree, error = %err, "reservation not returned");
        }
        let purged = self.routes.purge_link(comtree, link);
        if purged > 0 {
            debug!(link = %link, comtree = %comtree, purged, "routes through departed member removed");
        }
        if let Ok(dropped) = self.queues.remove_queue(link, comtree) {
            if dropped > 0 {
                debug!(link = %link, comtree = %comtree, dropped, "queue removed with packets");
            }
        }
    }

    pub fn drop_comtree_link(&self, comtree: ComtreeId, link: LinkId) -> Result<()> {
        self.comtrees.update(comtree, |e| e.remove_member(link))?;
        self.release_member(comtree, link);
        Ok(())
    }

    pub fn resize_comtree_link(&self, comtree: ComtreeId, link: LinkId, rate: u32) -> Result<()> {
        if !self.comtrees.read(comtree, |e| e.is_member(link))? {
            return Err(RouterError::topology(format!("{link} not in {comtree}")));
        }
        self.links.resize_rate(link, comtree, rate)?;
        self.comtrees.update(comtree, |e| e.set_rate(link, rate))?;
        self.queues.configure_queue(link, comtree, rate)
    }

    /// Remove a comtree and everything its members held.
    pub fn drop_comtree(&self, comtree: ComtreeId) -> Result<ComtreeInfo> {
        let info = self.comtrees.remove_comtree(comtree)?;
        for (link, _) in &info.members {
            self.release_member(comtree, *link);
        }
        self.routes.purge_comtree(comtree);
        Ok(info)
    }

    // ─── Routes ──────────────────────────────────────────────────────────────

    fn require_member(&self, comtree: ComtreeId, link: LinkId) -> Result<()> {
        if self.comtrees.read(comtree, |e| e.is_member(link))? {
            Ok(())
        } else {
            Err(RouterError::topology(format!("{link} not in {comtree}")))
        }
    }

    /// Install a route whose link is a member of `comtree`.
    pub fn add_route(&self, comtree: ComtreeId, dest: FlatAddr, link: LinkId) -> Result<()> {
        self.require_member(comtree, link)?;
        self.routes.add_route(comtree, dest, link)
    }

    pub fn mod_route(&self, comtree: ComtreeId, dest: FlatAddr, link: LinkId) -> Result<()> {
        self.require_member(comtree, link)?;
        self.routes.mod_route(comtree, dest, link)
    }

    /// Subscribe member `link` to `group`. Returns true when the group is
    /// new at this router.
    pub fn subscribe(&self, comtree: ComtreeId, group: FlatAddr, link: LinkId) -> Result<bool> {
        self.require_member(comtree, link)?;
        self.routes.subscribe(comtree, group, link)
    }

    // ─── Output ──────────────────────────────────────────────────────────────

    /// Queue a signalling packet on `link`'s default queue.
    pub fn send_control(&self, link: LinkId, packet: &Packet) -> Result<()> {
        let result = self
            .store
            .allocate(packet.header, None, packet.payload.clone())
            .and_then(|handle| {
                let len = packet.header.packet_len();
                self.queues
                    .enqueue_default(link, packet.header.comtree, handle, len)
                    .inspect_err(|_| {
                        let _ = self.store.release(handle);
                    })
            });
        if let Err(err) = &result {
            if let Some(reason) = DropReason::for_error(err) {
                self.stats.record_drop(reason);
            }
        }
        result
    }
}

impl std::fmt::Debug for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterState")
            .field("addr", &self.addr)
            .field("links", &self.links.len())
            .field("comtrees", &self.comtrees.len())
            .field("store", &self.store)
            .finish()
    }
}
