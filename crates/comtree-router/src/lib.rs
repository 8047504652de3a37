//! # comtree-router
//!
//! Runs a [`comtree_core`] router over UDP: bootstrap configuration, the
//! socket transport, and the receive, transmit and control threads.

pub mod config;
pub mod runtime;
pub mod transport;

pub use config::{RouterConfig, RouterConfigInput};
pub use runtime::RouterRuntime;
