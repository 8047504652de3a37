//! # Unicast Routes and Multicast Subscriptions
//!
//! Destinations this router knows per comtree, on top of the tree itself.
//!
//! - A unicast entry names the one member link toward an address. Addresses
//!   in another zip code are reached through the entry for the whole zip,
//!   keyed as `zip.0`.
//! - A multicast entry lists the member links that have subscribers for a
//!   group. Groups without an entry follow the whole tree.
//!
//! Unicast entries are installed by a controller or learned from route
//! replies; multicast entries come from subscription packets or a
//! controller. Entries are purged when their link leaves the comtree.
//!
//! ## Subscription payload
//!
//! ```text
//! +-----------+------------------+-----------+------------------+
//! | join cnt  | join addrs (32)… | leave cnt | leave addrs (32)…|
//! +-----------+------------------+-----------+------------------+
//! ```
//!
//! All fields are big-endian u32; the two counts together are at most
//! [`MAX_SUBSCRIPTION_ADDRS`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr, LinkId};

/// Most group addresses one subscription packet may carry.
pub const MAX_SUBSCRIPTION_ADDRS: usize = 350;

// ─── Route ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Unicast(LinkId),
    /// Links with subscribers to the group.
    Multicast(BTreeSet<LinkId>),
}

impl Route {
    pub fn links(&self) -> Vec<LinkId> {
        match self {
            Route::Unicast(l) => vec![*l],
            Route::Multicast(set) => set.iter().copied().collect(),
        }
    }

    pub fn contains(&self, link: LinkId) -> bool {
        match self {
            Route::Unicast(l) => *l == link,
            Route::Multicast(set) => set.contains(&link),
        }
    }
}

/// Key a destination is routed by at a router in `local_zip`: foreign
/// unicast addresses collapse to their zip.
pub fn route_key(dest: FlatAddr, local_zip: u16) -> FlatAddr {
    if dest.is_unicast() && dest.zip() != local_zip {
        FlatAddr::new(dest.zip(), 0)
    } else {
        dest
    }
}

fn routable(dest: FlatAddr) -> Result<()> {
    if dest.is_multicast() || dest.zip() != 0 {
        Ok(())
    } else {
        Err(RouterError::protocol(format!("{dest} is not a routable address")))
    }
}

// ─── Route Table ─────────────────────────────────────────────────────────────

type RouteMap = HashMap<(ComtreeId, FlatAddr), Route>;

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<RouteMap>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RouteMap> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RouteMap> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a route: a unicast destination (or a whole zip as `zip.0`)
    /// via `link`, or a group with `link` as its first subscriber.
    pub fn add_route(&self, comtree: ComtreeId, dest: FlatAddr, link: LinkId) -> Result<()> {
        routable(dest)?;
        let mut routes = self.write();
        if routes.contains_key(&(comtree, dest)) {
            return Err(RouterError::Duplicate(format!("route to {dest} in {comtree}")));
        }
        let route = if dest.is_multicast() {
            Route::Multicast(BTreeSet::from([link]))
        } else {
            Route::Unicast(link)
        };
        routes.insert((comtree, dest), route);
        Ok(())
    }

    pub fn drop_route(&self, comtree: ComtreeId, dest: FlatAddr) -> Result<Route> {
        self.write()
            .remove(&(comtree, dest))
            .ok_or(RouterError::UnknownRoute { comtree, dest })
    }

    pub fn get_route(&self, comtree: ComtreeId, dest: FlatAddr) -> Result<Route> {
        self.read()
            .get(&(comtree, dest))
            .cloned()
            .ok_or(RouterError::UnknownRoute { comtree, dest })
    }

    /// Point an existing unicast route at `link`.
    pub fn mod_route(&self, comtree: ComtreeId, dest: FlatAddr, link: LinkId) -> Result<()> {
        let mut routes = self.write();
        match routes.get_mut(&(comtree, dest)) {
            Some(Route::Unicast(l)) => {
                *l = link;
                Ok(())
            }
            Some(Route::Multicast(_)) => Err(RouterError::topology(format!(
                "{dest} is a group; change its links instead"
            ))),
            None => Err(RouterError::UnknownRoute { comtree, dest }),
        }
    }

    /// Route toward `dest` from a router in `local_zip`.
    pub fn lookup(&self, comtree: ComtreeId, dest: FlatAddr, local_zip: u16) -> Option<Route> {
        let routes = self.read();
        if let Some(r) = routes.get(&(comtree, dest)) {
            return Some(r.clone());
        }
        let key = route_key(dest, local_zip);
        if key == dest {
            return None;
        }
        routes.get(&(comtree, key)).cloned()
    }

    /// Record `dest` as reachable via `link` unless a route already exists.
    /// Returns whether the route was added.
    pub fn learn(&self, comtree: ComtreeId, dest: FlatAddr, link: LinkId) -> bool {
        if !dest.is_unicast() {
            return false;
        }
        let mut routes = self.write();
        if routes.contains_key(&(comtree, dest)) {
            return false;
        }
        routes.insert((comtree, dest), Route::Unicast(link));
        true
    }

    /// Add `link` as a subscriber of `group`. Returns true when the group
    /// had no entry before.
    pub fn subscribe(&self, comtree: ComtreeId, group: FlatAddr, link: LinkId) -> Result<bool> {
        if !group.is_multicast() {
            return Err(RouterError::protocol(format!("{group} is not a group address")));
        }
        let mut routes = self.write();
        match routes.get_mut(&(comtree, group)) {
            Some(Route::Multicast(set)) => {
                set.insert(link);
                Ok(false)
            }
            Some(Route::Unicast(_)) => Err(RouterError::topology(format!(
                "{group} has a unicast route in {comtree}"
            ))),
            None => {
                routes.insert((comtree, group), Route::Multicast(BTreeSet::from([link])));
                Ok(true)
            }
        }
    }

    /// Remove `link` from `group`. Returns true when that removed the last
    /// subscriber and with it the entry.
    pub fn unsubscribe(&self, comtree: ComtreeId, group: FlatAddr, link: LinkId) -> bool {
        let mut routes = self.write();
        let Some(Route::Multicast(set)) = routes.get_mut(&(comtree, group)) else {
            return false;
        };
        if !set.remove(&link) || !set.is_empty() {
            return false;
        }
        routes.remove(&(comtree, group));
        true
    }

    /// Forget every route of `comtree` through `link`. Returns the number
    /// of entries removed outright.
    pub fn purge_link(&self, comtree: ComtreeId, link: LinkId) -> usize {
        let mut routes = self.write();
        let before = routes.len();
        routes.retain(|(c, _), route| {
            if *c != comtree {
                return true;
            }
            match route {
                Route::Unicast(l) => *l != link,
                Route::Multicast(set) => {
                    set.remove(&link);
                    !set.is_empty()
                }
            }
        });
        before - routes.len()
    }

    pub fn purge_comtree(&self, comtree: ComtreeId) -> usize {
        let mut routes = self.write();
        let before = routes.len();
        routes.retain(|(c, _), _| *c != comtree);
        before - routes.len()
    }

    /// Every route of `comtree`, ordered by destination.
    pub fn routes(&self, comtree: ComtreeId) -> Vec<(FlatAddr, Route)> {
        let mut out: Vec<(FlatAddr, Route)> = self
            .read()
            .iter()
            .filter(|((c, _), _)| *c == comtree)
            .map(|((_, dest), r)| (*dest, r.clone()))
            .collect();
        out.sort_by_key(|(dest, _)| *dest);
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

// ─── Subscription Packets ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub join: Vec<FlatAddr>,
    pub leave: Vec<FlatAddr>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.leave.is_empty()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 4 * (self.join.len() + self.leave.len()));
        for list in [&self.join, &self.leave] {
            buf.put_u32(list.len() as u32);
            for addr in list {
                buf.put_u32(addr.0);
            }
        }
        buf.freeze()
    }

    /// Decode a subscription payload. The counts must account for every
    /// byte and stay within [`MAX_SUBSCRIPTION_ADDRS`].
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let mut lists = [Vec::new(), Vec::new()];
        let mut total = 0usize;
        for list in &mut lists {
            if buf.remaining() < 4 {
                return Err(RouterError::protocol("truncated subscription count"));
            }
            let count = buf.get_u32() as usize;
            total = total.saturating_add(count);
            if total > MAX_SUBSCRIPTION_ADDRS {
                return Err(RouterError::protocol(format!(
                    "subscription lists {total} addresses, limit {MAX_SUBSCRIPTION_ADDRS}"
                )));
            }
            if buf.remaining() < 4 * count {
                return Err(RouterError::protocol("truncated subscription list"));
            }
            list.extend((0..count).map(|_| FlatAddr(buf.get_u32())));
        }
        if buf.has_remaining() {
            return Err(RouterError::protocol(format!(
                "{} trailing bytes after subscription",
                buf.remaining()
            )));
        }
        let [join, leave] = lists;
        Ok(Subscription { join, leave })
    }
}
