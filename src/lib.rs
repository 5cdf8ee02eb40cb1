//! hostbeat_agent: host-resident monitoring agent.
//!
//! Samples local OS telemetry and publishes it to a hostbeat server over a
//! persistent WebSocket, while accepting reverse operations (remote shell,
//! one-shot exec, self-update) pushed from that server.

pub mod config;
pub mod dialer;
pub mod discovery;
pub mod exec;
pub mod gpu;
pub mod ip;
pub mod metrics;
pub mod net_stats;
pub mod session;
pub mod state;
pub mod terminal;
pub mod types;
pub mod update;

pub use state::AgentState;
