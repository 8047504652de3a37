//! Error taxonomy for the router core.
//!
//! Every variant degrades to drop, deny or report. Nothing here is fatal to
//! the process.

use thiserror::Error;

use crate::ids::{ComtreeId, FlatAddr, LinkId};

/// Which bounded resource ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    PacketPool,
    ControlQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("resource exhausted: {0:?}")]
    ResourceExhausted(Resource),

    #[error("queue full on {link} for {comtree}")]
    QueueFull { link: LinkId, comtree: ComtreeId },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("admission denied on {link}: requested {requested} kb/s, {available} kb/s available")]
    AdmissionDenied {
        link: LinkId,
        requested: u32,
        available: u32,
    },

    #[error("unknown comtree {0}")]
    UnknownComtree(ComtreeId),

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("no route to {dest} in {comtree}")]
    UnknownRoute { comtree: ComtreeId, dest: FlatAddr },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("link {0} still carries reservations")]
    LinkInUse(LinkId),

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("invalid packet handle")]
    InvalidHandle,

    #[error("control request timed out")]
    Timeout,
}

impl RouterError {
    /// Pool exhaustion and full queues share drop-and-count handling.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            RouterError::ResourceExhausted(_) | RouterError::QueueFull { .. }
        )
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RouterError::Protocol(msg.into())
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        RouterError::InvalidTopology(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
