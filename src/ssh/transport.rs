//! Transport seam between the console and an authenticated SSH connection
//!
//! [`Connector`] produces a [`Transport`]; the connection manager and the
//! tunnel workers only ever talk to these traits. [`SshTransport`] is the
//! russh implementation, backed by the handle owner task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};

use super::handle_owner::HandleController;
use crate::config::Credentials;
use crate::error::ConsoleError;

/// Byte stream carried by an SSH channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ForwardStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ForwardStream>;

/// Write side of the interactive shell
pub type ShellWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Collected result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Trimmed stdout, or trimmed stderr when stdout is blank
    pub fn display_text(&self) -> String {
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            self.stderr.trim().to_string()
        } else {
            stdout.to_string()
        }
    }
}

/// Establishes authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>, ConsoleError>;
}

/// One authenticated SSH connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `command` on a fresh session channel and collect its output
    async fn exec(&self, command: &str) -> Result<CommandOutput, ConsoleError>;

    /// Open a PTY shell. Output is drained in the background.
    async fn open_shell(&self) -> Result<ShellWriter, ConsoleError>;

    /// Open a direct-tcpip channel to `host:port`
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream, ConsoleError>;

    /// Disconnect. Safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// [`Transport`] over a russh session owned by the handle owner task
pub struct SshTransport {
    session_id: String,
    controller: HandleController,
    closed: AtomicBool,
}

impl SshTransport {
    pub fn new(session_id: String, controller: HandleController) -> Self {
        Self {
            session_id,
            controller,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ConsoleError> {
        let mut channel = self.controller.open_session_channel().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // Exit status may arrive after EOF, so read until the channel closes
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        debug!(
            "Command finished on {} with exit code {:?}",
            self.session_id, exit_code
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn open_shell(&self) -> Result<ShellWriter, ConsoleError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| ConsoleError::Connectivity(format!("Failed to request PTY: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ConsoleError::Connectivity(format!("Failed to start shell: {}", e)))?;

        let (mut reader, writer) = tokio::io::split(channel.into_stream());

        // Nobody reads the shell; keep the window open by draining it
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => trace!("shell output on {}: {} bytes", session_id, n),
                }
            }
            debug!("Shell output closed on {}", session_id);
        });

        Ok(Box::new(writer))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream, ConsoleError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, originator_host, originator_port as u32)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.disconnect().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.controller.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_text_prefers_stdout() {
        let output = CommandOutput {
            stdout: "  /home/alice\n".into(),
            stderr: "warning\n".into(),
            exit_code: Some(0),
        };
        assert_eq!(output.display_text(), "/home/alice");
    }

    #[test]
    fn test_display_text_falls_back_to_stderr() {
        let output = CommandOutput {
            stdout: " \n".into(),
            stderr: "scancel: error: Invalid job id\n".into(),
            exit_code: Some(1),
        };
        assert_eq!(output.display_text(), "scancel: error: Invalid job id");
        assert_eq!(CommandOutput::default().display_text(), "");
    }

    #[tokio::test]
    async fn test_transport_after_owner_exit() {
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(1);
        drop(cmd_rx);
        let transport = SshTransport::new("s1".into(), HandleController::new(cmd_tx));

        assert!(transport.is_closed());
        assert!(matches!(
            transport.exec("hostname").await,
            Err(ConsoleError::Connectivity(_))
        ));
        transport.close().await;
        transport.close().await;
    }
}
