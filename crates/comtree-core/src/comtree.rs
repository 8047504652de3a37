//! # Comtree / Route Table
//!
//! Per-comtree membership at this router. Member links form a tree through
//! parent pointers: the upstream link (toward the core) and links attached
//! directly to the router have no parent; links joined below the upstream
//! link point at it. Routes are derived from membership and rebuilt after
//! every mutation, so lookups only clone a shared slice.
//!
//! The map of comtrees sits behind one `RwLock` that is write-locked only
//! when a comtree is created or removed. Each comtree has its own `RwLock`,
//! so mutations on one comtree never stall lookups on another.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Result, RouterError};
use crate::ids::{ComtreeId, FlatAddr, LinkId};

// ─── Members ─────────────────────────────────────────────────────────────────

/// How a member link entered the comtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberOrigin {
    /// Added by bootstrap or by a controller. Never pruned implicitly.
    Configured,
    /// Provisioned in-band by a join; pruned once it has no children.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Member {
    /// Parent link; `None` when attached directly to this router.
    pub parent: Option<LinkId>,
    pub origin: MemberOrigin,
    /// Rate reserved for this comtree on the link, in kb/s.
    pub rate: u32,
}

/// Links removed by a leave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Removed links in removal order, the leaving link first.
    pub removed: Vec<(LinkId, Member)>,
    /// The upstream link was pruned and the core must be told.
    pub upstream_pruned: Option<LinkId>,
}

// ─── Comtree Entry ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ComtreeEntry {
    id: ComtreeId,
    core_addr: FlatAddr,
    is_core: bool,
    upstream: Option<LinkId>,
    /// Link to provision as upstream when a join arrives and this router is
    /// not yet attached. Falls back to a link whose peer is the core.
    core_link: Option<LinkId>,
    members: BTreeMap<LinkId, Member>,
    routes: HashMap<LinkId, Arc<[LinkId]>>,
    all_links: Arc<[LinkId]>,
}

impl ComtreeEntry {
    pub fn new(id: ComtreeId, core_addr: FlatAddr, is_core: bool) -> Self {
        ComtreeEntry {
            id,
            core_addr,
            is_core,
            upstream: None,
            core_link: None,
            members: BTreeMap::new(),
            routes: HashMap::new(),
            all_links: Arc::from(Vec::new()),
        }
    }

    pub fn id(&self) -> ComtreeId {
        self.id
    }

    pub fn core_addr(&self) -> FlatAddr {
        self.core_addr
    }

    pub fn is_core(&self) -> bool {
        self.is_core
    }

    pub fn upstream(&self) -> Option<LinkId> {
        self.upstream
    }

    pub fn core_link(&self) -> Option<LinkId> {
        self.core_link
    }

    pub fn set_core_link(&mut self, link: Option<LinkId>) {
        self.core_link = link;
    }

    /// This router already reaches the core: it is the core or it has an
    /// upstream link.
    pub fn is_attached(&self) -> bool {
        self.is_core || self.upstream.is_some()
    }

    pub fn is_member(&self, link: LinkId) -> bool {
        self.members.contains_key(&link)
    }

    pub fn member(&self, link: LinkId) -> Option<Member> {
        self.members.get(&link).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (LinkId, Member)> + '_ {
        self.members.iter().map(|(l, m)| (*l, *m))
    }

    pub fn children(&self, link: LinkId) -> impl Iterator<Item = LinkId> + '_ {
        self.members
            .iter()
            .filter(move |(_, m)| m.parent == Some(link))
            .map(|(l, _)| *l)
    }

    fn has_children(&self, link: LinkId) -> bool {
        self.children(link).next().is_some()
    }

    pub fn set_core(&mut self, core_addr: FlatAddr, is_core: bool) {
        self.core_addr = core_addr;
        self.is_core = is_core;
        if is_core {
            self.upstream = None;
        }
    }

    /// Mark an existing member as the link toward the core.
    pub fn set_upstream(&mut self, link: Option<LinkId>) -> Result<()> {
        if let Some(l) = link {
            if self.is_core {
                return Err(RouterError::topology(format!("{} is rooted here", self.id)));
            }
            match self.members.get(&l) {
                Some(m) if m.parent.is_none() => {}
                Some(_) => {
                    return Err(RouterError::topology(format!(
                        "{l} has a parent in {}",
                        self.id
                    )))
                }
                None => {
                    return Err(RouterError::topology(format!(
                        "{l} is not a member of {}",
                        self.id
                    )))
                }
            }
        }
        self.upstream = link;
        Ok(())
    }

    pub fn set_rate(&mut self, link: LinkId, rate: u32) -> Result<()> {
        let m = self.members.get_mut(&link).ok_or_else(|| {
            RouterError::topology(format!("{link} is not a member of {}", self.id))
        })?;
        m.rate = rate;
        Ok(())
    }

    /// Attach `link` below `parent` (`None` = this router).
    pub fn attach(
        &mut self,
        link: LinkId,
        parent: Option<LinkId>,
        origin: MemberOrigin,
        rate: u32,
    ) -> Result<()> {
        if self.members.contains_key(&link) {
            return Err(RouterError::topology(format!(
                "{link} already in {}",
                self.id
            )));
        }
        if let Some(p) = parent {
            if !self.members.contains_key(&p) {
                return Err(RouterError::topology(format!(
                    "parent {p} not in {}",
                    self.id
                )));
            }
        }
        self.members.insert(
            link,
            Member {
                parent,
                origin,
                rate,
            },
        );
        Ok(())
    }

    /// Attach `link` as the upstream link.
    pub fn attach_upstream(&mut self, link: LinkId, origin: MemberOrigin, rate: u32) -> Result<()> {
        if self.is_core {
            return Err(RouterError::topology(format!("{} is rooted here", self.id)));
        }
        if let Some(up) = self.upstream {
            return Err(RouterError::topology(format!(
                "{} already has upstream {up}",
                self.id
            )));
        }
        self.attach(link, None, origin, rate)?;
        self.upstream = Some(link);
        Ok(())
    }

    /// Re-parent every parentless member except the upstream link below the
    /// upstream link.
    pub fn adopt_orphans(&mut self) {
        let Some(up) = self.upstream else {
            return;
        };
        for (link, m) in self.members.iter_mut() {
            if *link != up && m.parent.is_none() {
                m.parent = Some(up);
            }
        }
    }

    /// Remove a leaf link, then prune in-band parents left without children.
    pub fn detach(&mut self, link: LinkId) -> Result<LeaveOutcome> {
        if !self.members.contains_key(&link) {
            return Err(RouterError::topology(format!(
                "{link} not in {}",
                self.id
            )));
        }
        if self.has_children(link) {
            return Err(RouterError::topology(format!(
                "{link} still has children in {}",
                self.id
            )));
        }
        let mut outcome = LeaveOutcome::default();
        let mut next = Some(link);
        while let Some(l) = next.take() {
            let Some(m) = self.members.remove(&l) else {
                break;
            };
            outcome.removed.push((l, m));
            if self.upstream == Some(l) {
                self.upstream = None;
                if l != link {
                    outcome.upstream_pruned = Some(l);
                }
            }
            if let Some(p) = m.parent {
                let prunable = self
                    .members
                    .get(&p)
                    .is_some_and(|pm| pm.origin == MemberOrigin::Joined);
                if prunable && !self.has_children(p) {
                    next = Some(p);
                }
            }
        }
        Ok(outcome)
    }

    /// Remove a member regardless of origin; its children move up to its
    /// parent.
    pub fn remove_member(&mut self, link: LinkId) -> Result<Member> {
        let m = self.members.remove(&link).ok_or_else(|| {
            RouterError::topology(format!("{link} not in {}", self.id))
        })?;
        for child in self.members.values_mut() {
            if child.parent == Some(link) {
                child.parent = m.parent;
            }
        }
        if self.upstream == Some(link) {
            self.upstream = None;
        }
        Ok(m)
    }

    fn rebuild_routes(&mut self) {
        let links: Vec<LinkId> = self.members.keys().copied().collect();
        self.routes = links
            .iter()
            .map(|&ingress| {
                let egress: Vec<LinkId> = links.iter().copied().filter(|l| *l != ingress).collect();
                (ingress, Arc::from(egress))
            })
            .collect();
        self.all_links = Arc::from(links);
    }

    /// Egress links for a packet arriving on `ingress`.
    pub fn route(&self, ingress: LinkId) -> Option<Arc<[LinkId]>> {
        self.routes.get(&ingress).cloned()
    }

    pub fn info(&self) -> ComtreeInfo {
        ComtreeInfo {
            id: self.id,
            core_addr: self.core_addr,
            is_core: self.is_core,
            upstream: self.upstream,
            core_link: self.core_link,
            members: self.members().collect(),
        }
    }
}

/// Point-in-time copy of a comtree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComtreeInfo {
    pub id: ComtreeId,
    pub core_addr: FlatAddr,
    pub is_core: bool,
    pub upstream: Option<LinkId>,
    pub core_link: Option<LinkId>,
    pub members: Vec<(LinkId, Member)>,
}

/// Fields to change in [`ComtreeTable::modify_comtree`]; `None` keeps the
/// current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComtreeUpdate {
    pub core_addr: Option<FlatAddr>,
    pub is_core: Option<bool>,
    pub upstream: Option<Option<LinkId>>,
    pub core_link: Option<Option<LinkId>>,
}

// ─── Comtree Table ───────────────────────────────────────────────────────────

type SharedEntry = Arc<RwLock<ComtreeEntry>>;

#[derive(Debug, Default)]
pub struct ComtreeTable {
    comtrees: RwLock<HashMap<ComtreeId, SharedEntry>>,
}

impl ComtreeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: ComtreeId) -> Result<SharedEntry> {
        self.comtrees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(RouterError::UnknownComtree(id))
    }

    pub fn add_comtree(&self, id: ComtreeId, core_addr: FlatAddr, is_core: bool) -> Result<()> {
        let mut map = self.comtrees.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&id) {
            return Err(RouterError::Duplicate(id.to_string()));
        }
        map.insert(
            id,
            Arc::new(RwLock::new(ComtreeEntry::new(id, core_addr, is_core))),
        );
        Ok(())
    }

    /// Remove a comtree, returning its final state so the caller can release
    /// reservations and queues.
    pub fn remove_comtree(&self, id: ComtreeId) -> Result<ComtreeInfo> {
        let entry = self
            .comtrees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(RouterError::UnknownComtree(id))?;
        let info = entry.read().unwrap_or_else(PoisonError::into_inner).info();
        Ok(info)
    }

    /// Run `f` under the comtree's write lock, then rebuild its routes.
    pub fn update<T>(
        &self,
        id: ComtreeId,
        f: impl FnOnce(&mut ComtreeEntry) -> Result<T>,
    ) -> Result<T> {
        let entry = self.entry(id)?;
        let mut guard = entry.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        guard.rebuild_routes();
        out
    }

    /// Run `f` under the comtree's read lock.
    pub fn read<T>(&self, id: ComtreeId, f: impl FnOnce(&ComtreeEntry) -> T) -> Result<T> {
        let entry = self.entry(id)?;
        let guard = entry.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&guard))
    }

    pub fn modify_comtree(&self, id: ComtreeId, update: ComtreeUpdate) -> Result<()> {
        self.update(id, |e| {
            let addr = update.core_addr.unwrap_or(e.core_addr);
            let core = update.is_core.unwrap_or(e.is_core);
            let before = (e.core_addr, e.is_core, e.upstream);
            e.set_core(addr, core);
            if let Some(up) = update.upstream {
                if let Err(err) = e.set_upstream(up) {
                    (e.core_addr, e.is_core, e.upstream) = before;
                    return Err(err);
                }
            }
            if let Some(link) = update.core_link {
                e.core_link = link;
            }
            Ok(())
        })
    }

    /// Attach `new_link` as a child of `parent` (`None` = this router).
    pub fn apply_join(
        &self,
        id: ComtreeId,
        new_link: LinkId,
        parent: Option<LinkId>,
        origin: MemberOrigin,
        rate: u32,
    ) -> Result<()> {
        self.update(id, |e| e.attach(new_link, parent, origin, rate))
    }

    /// Detach a leaf link and prune in-band parents left childless.
    pub fn apply_leave(&self, id: ComtreeId, link: LinkId) -> Result<LeaveOutcome> {
        self.update(id, |e| e.detach(link))
    }

    /// Precomputed egress set for packets on `id` arriving over `ingress`.
    pub fn lookup_route(&self, id: ComtreeId, ingress: LinkId) -> Result<Arc<[LinkId]>> {
        self.read(id, |e| e.route(ingress))?.ok_or_else(|| {
            RouterError::topology(format!("{ingress} is not a member of {id}"))
        })
    }

    /// Every member link, for packets originated by this router.
    pub fn all_links(&self, id: ComtreeId) -> Result<Arc<[LinkId]>> {
        self.read(id, |e| e.all_links.clone())
    }

    pub fn is_member(&self, id: ComtreeId, link: LinkId) -> bool {
        self.read(id, |e| e.is_member(link)).unwrap_or(false)
    }

    pub fn contains(&self, id: ComtreeId) -> bool {
        self.entry(id).is_ok()
    }

    pub fn get(&self, id: ComtreeId) -> Result<ComtreeInfo> {
        self.read(id, ComtreeEntry::info)
    }

    /// Comtrees in which `link` is a member.
    pub fn comtrees_on_link(&self, link: LinkId) -> Vec<ComtreeId> {
        let entries: Vec<SharedEntry> = self
            .comtrees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut out: Vec<ComtreeId> = entries
            .iter()
            .filter_map(|e| {
                let e = e.read().unwrap_or_else(PoisonError::into_inner);
                e.is_member(link).then_some(e.id)
            })
            .collect();
        out.sort();
        out
    }

    pub fn ids(&self) -> Vec<ComtreeId> {
        let mut ids: Vec<ComtreeId> = self
            .comtrees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.comtrees.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: ComtreeId = ComtreeId(5);
    const A: LinkId = LinkId(1);
    const B: LinkId = LinkId(2);
    const D: LinkId = LinkId(3);

    fn routes_of(t: &ComtreeTable, ingress: LinkId) -> Vec<LinkId> {
        t.lookup_route(C, ingress).unwrap().to_vec()
    }

    #[test]
    fn routes_exclude_ingress() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(1, 1), false).unwrap();
        t.update(C, |e| e.attach_upstream(A, MemberOrigin::Configured, 0))
            .unwrap();
        t.apply_join(C, B, Some(A), MemberOrigin::Configured, 0).unwrap();
        t.apply_join(C, D, Some(A), MemberOrigin::Configured, 0).unwrap();
        assert_eq!(routes_of(&t, D), vec![A, B]);
        assert_eq!(routes_of(&t, A), vec![B, D]);
        assert_eq!(t.all_links(C).unwrap().len(), 3);
    }

    #[test]
    fn unknown_comtree_and_non_member() {
        let t = ComtreeTable::new();
        assert_eq!(
            t.lookup_route(C, A).unwrap_err(),
            RouterError::UnknownComtree(C)
        );
        t.add_comtree(C, FlatAddr::new(1, 1), true).unwrap();
        assert!(matches!(
            t.lookup_route(C, A),
            Err(RouterError::InvalidTopology(_))
        ));
        assert!(t.add_comtree(C, FlatAddr::new(1, 1), true).is_err());
    }

    #[test]
    fn join_rejects_bad_parent_and_duplicate() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(1, 1), true).unwrap();
        assert!(t.apply_join(C, B, Some(A), MemberOrigin::Joined, 0).is_err());
        t.apply_join(C, B, None, MemberOrigin::Joined, 0).unwrap();
        assert!(t.apply_join(C, B, None, MemberOrigin::Joined, 0).is_err());
    }

    #[test]
    fn leave_prunes_joined_upstream() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(9, 1), false).unwrap();
        t.update(C, |e| {
            e.attach_upstream(A, MemberOrigin::Joined, 10)?;
            e.attach(B, Some(A), MemberOrigin::Joined, 10)
        })
        .unwrap();
        let out = t.apply_leave(C, B).unwrap();
        assert_eq!(out.removed.len(), 2);
        assert_eq!(out.removed[0].0, B);
        assert_eq!(out.upstream_pruned, Some(A));
        let info = t.get(C).unwrap();
        assert!(info.members.is_empty());
        assert_eq!(info.upstream, None);
    }

    #[test]
    fn leave_keeps_configured_parent_and_siblings() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(9, 1), false).unwrap();
        t.update(C, |e| {
            e.attach_upstream(A, MemberOrigin::Configured, 0)?;
            e.attach(B, Some(A), MemberOrigin::Joined, 0)?;
            e.attach(D, Some(A), MemberOrigin::Joined, 0)
        })
        .unwrap();
        let out = t.apply_leave(C, B).unwrap();
        assert_eq!(out.removed.len(), 1);
        assert_eq!(out.upstream_pruned, None);
        assert!(t.is_member(C, A));
        assert!(t.is_member(C, D));
        assert_eq!(routes_of(&t, D), vec![A]);
    }

    #[test]
    fn leave_of_inner_link_refused() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(9, 1), false).unwrap();
        t.update(C, |e| {
            e.attach_upstream(A, MemberOrigin::Joined, 0)?;
            e.attach(B, Some(A), MemberOrigin::Joined, 0)
        })
        .unwrap();
        assert!(matches!(
            t.apply_leave(C, A),
            Err(RouterError::InvalidTopology(_))
        ));
        assert!(t.apply_leave(C, D).is_err());
    }

    #[test]
    fn core_cannot_take_upstream() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(1, 1), true).unwrap();
        assert!(t
            .update(C, |e| e.attach_upstream(A, MemberOrigin::Joined, 0))
            .is_err());
        assert!(!t.is_member(C, A));
    }

    #[test]
    fn modify_sets_core_link_and_upstream() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(9, 1), false).unwrap();
        t.apply_join(C, A, None, MemberOrigin::Configured, 0).unwrap();
        t.modify_comtree(
            C,
            ComtreeUpdate {
                upstream: Some(Some(A)),
                core_link: Some(Some(A)),
                ..Default::default()
            },
        )
        .unwrap();
        let info = t.get(C).unwrap();
        assert_eq!(info.upstream, Some(A));
        assert_eq!(info.core_link, Some(A));
        assert!(t
            .modify_comtree(
                C,
                ComtreeUpdate {
                    upstream: Some(Some(B)),
                    ..Default::default()
                }
            )
            .is_err());
    }

    #[test]
    fn remove_member_lifts_children() {
        let t = ComtreeTable::new();
        t.add_comtree(C, FlatAddr::new(9, 1), false).unwrap();
        t.update(C, |e| {
            e.attach_upstream(A, MemberOrigin::Configured, 0)?;
            e.attach(B, Some(A), MemberOrigin::Configured, 0)
        })
        .unwrap();
        t.update(C, |e| e.remove_member(A)).unwrap();
        let info = t.get(C).unwrap();
        assert_eq!(info.upstream, None);
        assert_eq!(info.members[0].1.parent, None);
        assert_eq!(t.comtrees_on_link(B), vec![C]);
    }
}
