//! SSH module - the login connection to the cluster
//!
//! # Features
//! - Password authentication over russh
//! - Host key verification via ~/.ssh/known_hosts
//! - Single-owner handle task shared by shell, commands and tunnels
//! - [`Connector`]/[`Transport`] seam used by the connection manager

mod client;
mod handle_owner;
pub mod known_hosts;
mod transport;

pub use client::{ClientHandler, SshConnector, INVALID_CREDENTIALS};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyDecision, HostKeyVerification, KnownHostsStore};
pub use transport::{
    BoxedStream, CommandOutput, Connector, ForwardStream, ShellWriter, SshTransport, Transport,
};
