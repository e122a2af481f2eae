//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Everything else
//! talks to it through a cloneable [`HandleController`] that sends
//! commands over an mpsc channel and waits for the reply on a oneshot.
//! Channel opens from the shell, command runner and tunnel workers are
//! therefore serialized onto the one connection.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::client::ClientHandler;
use crate::error::ConsoleError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (shell, exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (tunnels)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    Disconnect,
}

/// Sender side of the handle owner. Cloning is cheap.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

fn owner_gone() -> ConsoleError {
    ConsoleError::Connectivity("SSH session has been closed".to_string())
}

impl HandleController {
    /// Wrap an existing sender. Production code uses `spawn_handle_owner_task`.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, ConsoleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| owner_gone())?;
        reply_rx
            .await
            .map_err(|_| owner_gone())?
            .map_err(|e| ConsoleError::Connectivity(format!("Failed to open session channel: {}", e)))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, ConsoleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| owner_gone())?;
        reply_rx.await.map_err(|_| owner_gone())?.map_err(|e| {
            ConsoleError::Connectivity(format!(
                "Failed to open direct-tcpip channel to {}:{}: {}",
                host, port, e
            ))
        })
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Owner task still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its own task and return the controller for it
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }
                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx }
}

/// Close the queue and fail every command still waiting in it
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_owner_is_connectivity_error() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        assert!(controller.is_connected());

        drop(cmd_rx);
        assert!(!controller.is_connected());

        let err = controller.open_session_channel().await.unwrap_err();
        assert!(matches!(err, ConsoleError::Connectivity(_)));
        let err = controller
            .open_direct_tcpip("node-01", 22, "127.0.0.1", 40000)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.open_direct_tcpip("node-01", 22, "127.0.0.1", 40000).await }
        });

        // Wait until the command is queued, then drain as the owner would on exit
        while cmd_rx.is_empty() {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut cmd_rx);

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("node-01:22"));
        assert!(!controller.is_connected());
    }
}
