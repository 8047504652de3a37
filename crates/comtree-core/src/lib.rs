//! # comtree-core
//!
//! Pure forwarding and control logic of a comtree overlay router. No
//! sockets or threads live here: the runtime feeds received datagrams into
//! [`forward::ForwardingEngine::receive`], drives
//! [`engine::ControlEngine::poll`] from one control thread, and drains
//! per-link output with [`forward::ForwardingEngine::transmit_ready`].
//!
//! ## Modules
//!
//! - [`wire`]: 16-byte packet header and packet codec
//! - [`control`]: control packet codec (type, mode, sequence, attributes)
//! - [`pool`]: fixed-capacity packet store with shared payload buffers
//! - [`link`]: link table and per-comtree rate admission
//! - [`queue`]: per-link DRR/FIFO queues with token-bucket pacing
//! - [`comtree`]: comtree membership and derived routes
//! - [`route`]: unicast routes and multicast subscriptions per comtree
//! - [`pending`]: outstanding control requests and retransmission
//! - [`engine`]: control protocol handlers
//! - [`forward`]: datagram classification and fan-out
//! - [`state`]: shared tables and composite operations
//! - [`stats`]: counters and serializable snapshots

pub mod comtree;
pub mod control;
pub mod engine;
pub mod error;
pub mod forward;
pub mod ids;
pub mod link;
pub mod pending;
pub mod pool;
pub mod queue;
pub mod route;
pub mod state;
pub mod stats;
pub mod wire;

pub use error::{Result, RouterError};
pub use ids::{ComtreeId, FlatAddr, LinkId};
