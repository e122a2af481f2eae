//! Console context
//!
//! Bundles the connection and tunnel managers for one operator session.
//! Constructed explicitly and passed to whatever drives it (the REPL, tests).

use std::sync::Arc;

use tracing::info;

use crate::config::{ConsoleConfig, Credentials, TunnelSettings};
use crate::connection::ConnectionManager;
use crate::error::ConsoleError;
use crate::forwarding::TunnelManager;
use crate::scheduler::SchedulerCommand;
use crate::ssh::{Connector, SshConnector};

pub struct Console {
    connection: Arc<ConnectionManager>,
    tunnels: TunnelManager,
    email: Option<String>,
}

impl Console {
    /// Console talking to the configured login host over SSH
    pub fn new(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let connector = SshConnector::from_config(config)?;
        let connection = ConnectionManager::new(Arc::new(connector))
            .with_pwd_timeout(config.connect_timeout());
        Ok(Self::from_parts(connection, config.tunnel.clone()).with_email(config.email.clone()))
    }

    pub fn with_connector(connector: Arc<dyn Connector>, tunnel_settings: TunnelSettings) -> Self {
        Self::from_parts(ConnectionManager::new(connector), tunnel_settings)
    }

    fn from_parts(connection: ConnectionManager, tunnel_settings: TunnelSettings) -> Self {
        let connection = Arc::new(connection);
        let tunnels = TunnelManager::new(connection.clone(), tunnel_settings);
        Self {
            connection,
            tunnels,
            email: None,
        }
    }

    /// Notification address handed to submitted batch jobs
    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<(), ConsoleError> {
        self.connection.connect(credentials).await
    }

    /// Close every tunnel, then the session
    pub async fn logout(&self) -> String {
        let tunnels = self.tunnels.close_all_tunnels().await;
        self.connection.close().await;
        info!("Logged out ({})", tunnels);
        tunnels
    }

    /// Same as [`Console::logout`], safe to call repeatedly
    pub async fn shutdown(&self) {
        if !self.tunnels.is_empty().await || self.connection.is_connected().await {
            self.logout().await;
        } else {
            self.connection.close().await;
        }
    }

    /// Logged-in user, required by the per-user scheduler listings
    pub fn current_user(&self) -> Result<String, ConsoleError> {
        self.connection.username().ok_or(ConsoleError::NotConnected)
    }

    pub async fn scheduler(&self, command: &SchedulerCommand) -> Result<String, ConsoleError> {
        command.execute(&self.connection).await
    }
}
