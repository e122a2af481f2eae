//! SSH client built on russh: handshake, host key check and password login

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::PublicKey;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{decide, HostKeyDecision, KnownHostsStore};
use super::transport::{Connector, SshTransport, Transport};
use crate::config::{ConsoleConfig, Credentials, HostKeyPolicy};
use crate::error::ConsoleError;

/// Shown to the operator on any rejected login
pub const INVALID_CREDENTIALS: &str = "Invalid username or password.";

/// Connects to the configured login host with password authentication
pub struct SshConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    keepalive_interval: Option<Duration>,
    keepalive_max: usize,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshConnector {
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let known_hosts_path = config
            .known_hosts_path
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path);

        Ok(Self {
            host: config.remote_host()?.to_string(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            keepalive_interval: (config.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(config.keepalive_interval_secs)),
            keepalive_max: config.keepalive_max,
            policy: config.host_key_policy,
            known_hosts: Arc::new(KnownHostsStore::open(known_hosts_path)),
        })
    }

    async fn handshake(&self) -> Result<client::Handle<ClientHandler>, ConsoleError> {
        let addr = format!("{}:{}", self.host, self.port);
        let socket_addr = lookup_host(&addr)
            .await
            .map_err(|e| ConsoleError::Connectivity(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ConsoleError::Connectivity(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler {
            host: self.host.clone(),
            port: self.port,
            policy: self.policy,
            known_hosts: self.known_hosts.clone(),
        };

        tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            ConsoleError::Connectivity(format!(
                "Timed out connecting to {} after {}s",
                addr,
                self.connect_timeout.as_secs()
            ))
        })?
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>, ConsoleError> {
        credentials.validate()?;
        info!("Connecting to SSH server at {}:{}", self.host, self.port);

        let mut handle = self.handshake().await?;
        debug!("SSH handshake completed");

        let auth = handle
            .authenticate_password(&credentials.username, &credentials.password)
            .await
            .map_err(|e| ConsoleError::Connectivity(format!("Authentication exchange failed: {}", e)))?;

        if !auth.success() {
            warn!("Server rejected password for {}", credentials.username);
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            return Err(ConsoleError::Authentication(INVALID_CREDENTIALS.to_string()));
        }

        info!("SSH authentication successful for {}", credentials.username);

        let session_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, session_id.clone());
        Ok(Arc::new(SshTransport::new(session_id, controller)))
    }
}

/// russh callbacks for the login connection
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
}

impl client::Handler for ClientHandler {
    type Error = ConsoleError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = KnownHostsStore::fingerprint(server_public_key);
        let verification = self
            .known_hosts
            .verify(&self.host, self.port, server_public_key);

        match decide(self.policy, &self.host, self.port, &verification) {
            HostKeyDecision::Accept => {
                if self.policy == HostKeyPolicy::AcceptAny {
                    warn!(
                        "Accepting host key for {}:{} without verification ({})",
                        self.host, self.port, fingerprint
                    );
                } else {
                    info!("Host key verified for {}:{}", self.host, self.port);
                }
                Ok(true)
            }
            HostKeyDecision::AcceptAndRecord => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self
                    .known_hosts
                    .add_host(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyDecision::Reject(reason) => {
                warn!("Rejecting host key for {}:{}: {}", self.host, self.port, reason);
                Err(ConsoleError::Connectivity(format!(
                    "Host key verification failed: {}",
                    reason
                )))
            }
        }
    }
}
