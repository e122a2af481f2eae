//! Tunnel Manager
//!
//! Tracks at most one [`Tunnel`] per compute node, all multiplexed over the
//! session held by the [`ConnectionManager`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::tunnel::{Tunnel, TunnelInfo};
use crate::config::TunnelSettings;
use crate::connection::ConnectionManager;
use crate::error::ConsoleError;

pub struct TunnelManager {
    connection: Arc<ConnectionManager>,
    settings: TunnelSettings,
    tunnels: RwLock<HashMap<String, Tunnel>>,
}

impl TunnelManager {
    pub fn new(connection: Arc<ConnectionManager>, settings: TunnelSettings) -> Self {
        Self {
            connection,
            settings,
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Forward `localhost:local_port` to `node:22`.
    /// Asking again for a node with a running tunnel reports the existing one;
    /// a tunnel whose worker has stopped is torn down and opened again.
    pub async fn setup_tunnel(&self, node: &str, local_port: u16) -> Result<String, ConsoleError> {
        let node = node.trim();
        if node.is_empty() {
            return Err(ConsoleError::Configuration(
                "Node name must not be empty.".to_string(),
            ));
        }

        let mut tunnels = self.tunnels.write().await;
        let existing = tunnels
            .get(node)
            .map(|t| (t.is_running(), t.local_port()));
        let stopped = match existing {
            Some((true, port)) => {
                return Ok(format!(
                    "Tunnel to {} already exists on localhost:{}.",
                    node, port
                ));
            }
            Some((false, _)) => tunnels.remove(node),
            None => None,
        };
        if let Some(stopped) = stopped {
            info!("Replacing stopped tunnel to {}", node);
            let report = stopped.shutdown(self.settings.join_timeout()).await;
            if !report.is_clean() {
                warn!(
                    "Stopped tunnel to {} removed with {} teardown error(s)",
                    node,
                    report.errors.len()
                );
            }
        }

        let transport = self
            .connection
            .transport()
            .await
            .ok_or(ConsoleError::TransportUnavailable)?;

        let tunnel = Tunnel::open(node, local_port, transport, &self.settings)?;
        let port = tunnel.local_port();
        tunnels.insert(node.to_string(), tunnel);

        info!("Tunnel established to {} on localhost:{}", node, port);
        Ok(format!("Tunnel established to {} on localhost:{}.", node, port))
    }

    /// Stop forwarding for `node` and release its local port
    pub async fn close_tunnel(&self, node: &str) -> Result<String, ConsoleError> {
        let node = node.trim();
        let mut tunnels = self.tunnels.write().await;
        let tunnel = tunnels
            .remove(node)
            .ok_or_else(|| ConsoleError::NoSuchTunnel(node.to_string()))?;

        let report = tunnel.shutdown(self.settings.join_timeout()).await;
        if !report.is_clean() {
            warn!(
                "Tunnel to {} removed with {} teardown error(s)",
                node,
                report.errors.len()
            );
        }
        Ok(format!("Tunnel to {} closed.", node))
    }

    /// Close every tunnel. A failing teardown never stops the others.
    pub async fn close_all_tunnels(&self) -> String {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.is_empty() {
            return "No active tunnels.".to_string();
        }

        let mut closed = 0;
        let mut failed = Vec::new();
        for (node, tunnel) in tunnels.drain() {
            let report = tunnel.shutdown(self.settings.join_timeout()).await;
            closed += 1;
            if !report.is_clean() {
                failed.push(node);
            }
        }

        info!("Closed {} tunnel(s)", closed);
        if failed.is_empty() {
            format!("Closed {} tunnel(s).", closed)
        } else {
            failed.sort();
            format!(
                "Closed {} tunnel(s); teardown errors for {}.",
                closed,
                failed.join(", ")
            )
        }
    }

    /// Local port forwarded to `node`, for display
    pub async fn tunnel_port(&self, node: &str) -> Option<u16> {
        self.tunnels.read().await.get(node).map(Tunnel::local_port)
    }

    pub async fn has_tunnel(&self, node: &str) -> bool {
        self.tunnels.read().await.contains_key(node)
    }

    /// Snapshot of every tunnel, sorted by node
    pub async fn tunnels(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self.tunnels.read().await.values().map(Tunnel::info).collect();
        infos.sort_by(|a, b| a.node.cmp(&b.node));
        infos
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }
}
