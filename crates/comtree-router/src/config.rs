//! # Bootstrap Configuration
//!
//! TOML file describing the router's address, socket, resource limits, links
//! and initial comtree memberships. Parsed into `*Input` structs where every
//! field is optional, then resolved into a validated [`RouterConfig`].
//!
//! ```toml
//! address = "1.1"
//! bind = "0.0.0.0:30123"
//!
//! [[links]]
//! id = 1
//! peer = "1.2"
//! endpoint = "10.0.0.2:30123"
//! capacity = 10000
//!
//! [[comtrees]]
//! id = 5
//! core = "1.1"
//!
//! [[comtrees.members]]
//! link = 1
//! rate = 500
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use comtree_core::comtree::MemberOrigin;
use comtree_core::engine::EngineConfig;
use comtree_core::link::{LinkEntry, PeerType};
use comtree_core::queue::{Discipline, QueueLimits};
use comtree_core::state::{Attach, RouterLimits, RouterState};
use comtree_core::{ComtreeId, FlatAddr, LinkId};

pub const CONFIG_VERSION: u32 = 1;

/// Default UDP port of a comtree router.
pub const DEFAULT_PORT: u16 = 30123;

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfigInput {
    pub version: u32,
    pub address: Option<String>,
    pub bind: Option<String>,
    pub stats_interval_secs: Option<u64>,
    pub limits: LimitsInput,
    pub control: ControlInput,
    pub links: Vec<LinkInput>,
    pub comtrees: Vec<ComtreeInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsInput {
    pub pool_capacity: Option<usize>,
    pub max_queue_packets: Option<usize>,
    pub max_queue_bytes: Option<usize>,
    pub discipline: Option<Discipline>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlInput {
    pub retry_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub id: Option<u16>,
    pub peer: String,
    pub peer_type: Option<PeerType>,
    pub endpoint: Option<String>,
    pub capacity: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComtreeInput {
    pub id: u32,
    pub core: Option<String>,
    pub is_core: Option<bool>,
    pub core_link: Option<u16>,
    pub members: Vec<MemberInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemberInput {
    pub link: u16,
    pub rate: u32,
    pub upstream: bool,
    pub parent: Option<u16>,
}

// ─── Resolved ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub id: LinkId,
    pub peer: FlatAddr,
    pub peer_type: PeerType,
    pub endpoint: Option<SocketAddr>,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberConfig {
    pub link: LinkId,
    pub rate: u32,
    pub upstream: bool,
    pub parent: Option<LinkId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComtreeConfig {
    pub id: ComtreeId,
    pub core: FlatAddr,
    pub is_core: bool,
    pub core_link: Option<LinkId>,
    /// Upstream member first, then the rest in file order.
    pub members: Vec<MemberConfig>,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub version: u32,
    pub address: FlatAddr,
    pub bind: SocketAddr,
    pub stats_interval: Duration,
    pub limits: RouterLimits,
    pub engine: EngineConfig,
    pub links: Vec<LinkConfig>,
    pub comtrees: Vec<ComtreeConfig>,
}

impl RouterConfig {
    /// Minimal configuration for a router at `address` with no links.
    pub fn new(address: FlatAddr, bind: SocketAddr) -> Self {
        RouterConfig {
            version: CONFIG_VERSION,
            address,
            bind,
            stats_interval: Duration::from_secs(10),
            limits: RouterLimits::default(),
            engine: EngineConfig::default(),
            links: Vec::new(),
            comtrees: Vec::new(),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        let parsed: RouterConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

fn parse_addr(what: &str, s: &str) -> Result<FlatAddr, String> {
    let addr: FlatAddr = s.parse().map_err(|e| format!("{what}: {e}"))?;
    if !addr.is_unicast() {
        return Err(format!("{what}: {addr} is not a unicast address"));
    }
    Ok(addr)
}

impl RouterConfigInput {
    pub fn resolve(self) -> Result<RouterConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let address = match self.address.as_deref() {
            Some(s) => parse_addr("address", s)?,
            None => return Err("router address is required".into()),
        };
        let bind: SocketAddr = match self.bind.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s
                .parse()
                .map_err(|e| format!("invalid bind address '{s}': {e}"))?,
            _ => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        };

        let mut config = RouterConfig::new(address, bind);
        config.version = version;
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval = Duration::from_secs(secs.max(1));
        }

        let defaults = RouterLimits::default();
        config.limits = RouterLimits {
            pool_capacity: self
                .limits
                .pool_capacity
                .unwrap_or(defaults.pool_capacity)
                .max(16),
            queue_limits: QueueLimits {
                max_packets: self
                    .limits
                    .max_queue_packets
                    .unwrap_or(defaults.queue_limits.max_packets)
                    .max(1),
                max_bytes: self
                    .limits
                    .max_queue_bytes
                    .unwrap_or(defaults.queue_limits.max_bytes)
                    .max(comtree_core::queue::MTU),
            },
            discipline: self.limits.discipline.unwrap_or(defaults.discipline),
        };

        let engine = EngineConfig::default();
        config.engine = EngineConfig {
            retry_timeout: self
                .control
                .retry_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(engine.retry_timeout),
            max_attempts: self.control.max_attempts.unwrap_or(engine.max_attempts).max(1),
            work_queue_capacity: self
                .control
                .queue_capacity
                .unwrap_or(engine.work_queue_capacity)
                .max(1),
        };

        let mut ids = HashSet::new();
        let mut endpoints = HashSet::new();
        for (idx, link) in self.links.into_iter().enumerate() {
            let id = match link.id {
                Some(id) => id,
                None => u16::try_from(idx + 1).map_err(|_| "too many links".to_string())?,
            };
            if !ids.insert(id) {
                return Err(format!("duplicate link id {id}"));
            }
            let peer = parse_addr(&format!("link {id} peer"), &link.peer)?;
            let endpoint = match link.endpoint.as_deref().map(str::trim) {
                Some(s) if !s.is_empty() => {
                    let ep: SocketAddr = s
                        .parse()
                        .map_err(|e| format!("link {id}: invalid endpoint '{s}': {e}"))?;
                    if !endpoints.insert(ep) {
                        return Err(format!("link {id}: endpoint {ep} already used"));
                    }
                    Some(ep)
                }
                _ => None,
            };
            config.links.push(LinkConfig {
                id: LinkId(id),
                peer,
                peer_type: link.peer_type.unwrap_or_default(),
                endpoint,
                capacity: link.capacity,
            });
        }

        let mut comtree_ids = HashSet::new();
        for comtree in self.comtrees {
            if !comtree_ids.insert(comtree.id) {
                return Err(format!("duplicate comtree {}", comtree.id));
            }
            let core = match comtree.core.as_deref() {
                Some(s) => parse_addr(&format!("comtree {} core", comtree.id), s)?,
                None => address,
            };
            let is_core = comtree.is_core.unwrap_or(core == address);
            let check_link = |l: u16| {
                if ids.contains(&l) {
                    Ok(LinkId(l))
                } else {
                    Err(format!("comtree {}: unknown link {l}", comtree.id))
                }
            };
            let core_link = comtree.core_link.map(check_link).transpose()?;

            let mut members = Vec::with_capacity(comtree.members.len());
            let mut seen = HashSet::new();
            for m in comtree.members {
                let link = check_link(m.link)?;
                if !seen.insert(link) {
                    return Err(format!("comtree {}: {link} listed twice", comtree.id));
                }
                members.push(MemberConfig {
                    link,
                    rate: m.rate,
                    upstream: m.upstream,
                    parent: m.parent.map(check_link).transpose()?,
                });
            }
            if members.iter().filter(|m| m.upstream).count() > 1 {
                return Err(format!("comtree {}: more than one upstream link", comtree.id));
            }
            if is_core && members.iter().any(|m| m.upstream) {
                return Err(format!("comtree {}: core router cannot have an upstream link", comtree.id));
            }
            members.sort_by_key(|m| !m.upstream);

            config.comtrees.push(ComtreeConfig {
                id: ComtreeId(comtree.id),
                core,
                is_core,
                core_link,
                members,
            });
        }

        Ok(config)
    }
}

// ─── Bootstrap ───────────────────────────────────────────────────────────────

/// Load links and comtrees into freshly created router state.
pub fn bootstrap(state: &RouterState, config: &RouterConfig) -> anyhow::Result<()> {
    for link in &config.links {
        let mut entry =
            LinkEntry::new(link.id, link.peer, link.capacity).with_peer_type(link.peer_type);
        if let Some(ep) = link.endpoint {
            entry = entry.with_endpoint(ep);
        }
        state
            .add_link(entry)
            .with_context(|| format!("adding link {}", link.id))?;
    }

    for comtree in &config.comtrees {
        state
            .comtrees
            .add_comtree(comtree.id, comtree.core, comtree.is_core)
            .with_context(|| format!("adding {}", comtree.id))?;
        if comtree.core_link.is_some() {
            state.comtrees.update(comtree.id, |e| {
                e.set_core_link(comtree.core_link);
                Ok(())
            })?;
        }
        for m in &comtree.members {
            let attach = if m.upstream {
                Attach::Upstream
            } else {
                Attach::Below(m.parent)
            };
            state
                .add_comtree_link(comtree.id, m.link, attach, MemberOrigin::Configured, m.rate)
                .with_context(|| format!("adding {} to {}", m.link, comtree.id))?;
        }
    }

    info!(
        links = config.links.len(),
        comtrees = config.comtrees.len(),
        "bootstrap configuration loaded"
    );
    Ok(())
}
