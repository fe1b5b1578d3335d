//! Agent tunnel to the control plane.
//!
//! One session runs four independent WebSocket streams side by side:
//!
//! - **command**: the control plane invokes the local request handler
//!   (`command.rs`)
//! - **events**: application events pushed to the control plane
//!   (`events.rs`)
//! - **logs** / **notifications**: two instances of the generic stream
//!   relay multiplexing many logical push-streams (`relay.rs`)
//!
//! The [`agent::Agent`] supervisor keeps one session alive, tearing the whole
//! session down when any stream fails and reconnecting after a fixed pause.

pub mod agent;
pub mod command;
pub mod connector;
pub mod events;
pub mod group;
pub mod protocol;
pub mod relay;
pub mod timed;

use std::time::Duration;

use crate::config::TunnelConfig;

/// Per-frame deadlines shared by all tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTimeouts {
    pub send: Duration,
    pub receive: Duration,
}

impl TunnelTimeouts {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            send: config.send_timeout(),
            receive: config.receive_timeout(),
        }
    }
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}
