#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! testkube-agent library: the agent side of the control-plane tunnel.
//!
//! - `tunnel`: connector, command tunnel, event forwarder, stream relay and
//!   the reconnecting supervisor
//! - `hub`: in-memory execution output, the push source for both relays
//! - `routes`: the local request handler reached through the command tunnel
//! - `config`: configuration loading
//! - `error`: error types

pub mod config;
pub mod error;
pub mod hub;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{ConfigError, SourceError, TunnelError};
pub use hub::ExecutionHub;
pub use state::{AgentStatus, AppState};
pub use tunnel::agent::Agent;
pub use tunnel::events::{event_queue, Event, EventSender};
