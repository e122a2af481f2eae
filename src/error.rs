//! Console error types
//!
//! Every public operation of the connection and tunnel subsystem returns
//! one of these kinds. The `Display` text is meant to be shown to the
//! operator as-is.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Credentials or other required settings are missing or malformed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote host rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network, host key or SSH transport failure
    #[error("Connection error: {0}")]
    Connectivity(String),

    #[error("SSH connection is not established.")]
    NotConnected,

    #[error("SSH shell is not available.")]
    ShellUnavailable,

    #[error("SSH transport is not available.")]
    TransportUnavailable,

    #[error("Cannot listen on localhost:{port}: {reason}")]
    PortBind { port: u16, reason: String },

    #[error("No active tunnel to {0}.")]
    NoSuchTunnel(String),
}

impl ConsoleError {
    /// Classify a local bind failure the way operators expect to read it
    pub fn port_bind(port: u16, err: &std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::AddrInUse => {
                "port already in use, another application may be listening on it".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "permission denied, ports below 1024 require elevated privileges".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "address not available on this system".to_string()
            }
            _ => err.to_string(),
        };
        ConsoleError::PortBind { port, reason }
    }
}

impl From<russh::Error> for ConsoleError {
    fn from(err: russh::Error) -> Self {
        ConsoleError::Connectivity(err.to_string())
    }
}

impl From<std::io::Error> for ConsoleError {
    fn from(err: std::io::Error) -> Self {
        ConsoleError::Connectivity(err.to_string())
    }
}
