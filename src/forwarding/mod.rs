//! Node Tunnels
//!
//! Local port forwarding to compute nodes through the login session, for
//! reaching notebooks or editors running inside an allocation.

pub mod manager;
mod relay;
mod tunnel;

pub use manager::TunnelManager;
pub use relay::{relay, RelayEnd, RelayStats};
pub use tunnel::{TeardownReport, Tunnel, TunnelInfo};
