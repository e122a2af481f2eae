//! Connection Manager
//!
//! Owns the single authenticated session to the login host: a transport
//! used for one-shot commands and tunnels, plus one interactive shell for
//! fire-and-forget commands. Both are present or both are absent.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::error::ConsoleError;
use crate::ssh::{Connector, ShellWriter, Transport};

/// Upper bound on the `pwd` run at login
pub const DEFAULT_PWD_TIMEOUT: Duration = Duration::from_secs(30);

struct LiveConnection {
    transport: Arc<dyn Transport>,
    shell: ShellWriter,
}

impl LiveConnection {
    async fn shutdown(mut self) {
        if let Err(e) = self.shell.shutdown().await {
            debug!("Shell shutdown: {}", e);
        }
        self.transport.close().await;
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    /// Shell writes happen under this lock, which keeps them in call order
    state: Mutex<Option<LiveConnection>>,
    remote_dir: RwLock<Option<String>>,
    username: RwLock<Option<String>>,
    pwd_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Mutex::new(None),
            remote_dir: RwLock::new(None),
            username: RwLock::new(None),
            pwd_timeout: DEFAULT_PWD_TIMEOUT,
        }
    }

    /// Limit how long `connect` waits for the working directory lookup
    pub fn with_pwd_timeout(mut self, timeout: Duration) -> Self {
        self.pwd_timeout = timeout;
        self
    }

    /// Authenticate and open the interactive shell.
    /// Any previous session is closed first. On error nothing is left open.
    pub async fn connect(&self, credentials: &Credentials) -> Result<(), ConsoleError> {
        credentials.validate()?;

        let mut state = self.state.lock().await;
        if let Some(previous) = state.take() {
            info!("Replacing existing session");
            previous.shutdown().await;
        }
        self.reset_details();

        let transport = self.connector.connect(credentials).await?;

        let shell = match transport.open_shell().await {
            Ok(shell) => shell,
            Err(e) => {
                warn!("Failed to open interactive shell: {}", e);
                transport.close().await;
                return Err(match e {
                    ConsoleError::Connectivity(_) => e,
                    other => ConsoleError::Connectivity(other.to_string()),
                });
            }
        };

        match tokio::time::timeout(self.pwd_timeout, transport.exec("pwd")).await {
            Ok(Ok(output)) => {
                let dir = output.display_text();
                if !dir.is_empty() {
                    debug!("Remote working directory: {}", dir);
                    *self.remote_dir.write() = Some(dir);
                }
            }
            Ok(Err(e)) => warn!("Could not determine remote working directory: {}", e),
            Err(_) => warn!(
                "Remote working directory lookup timed out after {}s",
                self.pwd_timeout.as_secs_f32()
            ),
        }

        *self.username.write() = Some(credentials.username.clone());
        *state = Some(LiveConnection { transport, shell });
        info!("Connected as {}", credentials.username);
        Ok(())
    }

    /// Run `command` to completion on its own channel.
    /// Returns trimmed stdout, or trimmed stderr if stdout is blank.
    pub async fn run_command(&self, command: &str) -> Result<String, ConsoleError> {
        let transport = {
            let state = self.state.lock().await;
            match state.as_ref() {
                Some(live) => live.transport.clone(),
                None => return Err(ConsoleError::NotConnected),
            }
        };

        debug!("run_command: {}", command);
        let output = transport.exec(command).await?;
        Ok(output.display_text())
    }

    /// Send `command` to the interactive shell without waiting for it
    pub async fn run_async_command(&self, command: &str) -> Result<(), ConsoleError> {
        let mut state = self.state.lock().await;
        let live = state.as_mut().ok_or(ConsoleError::NotConnected)?;

        let line = format!("{}\n", command);
        let written = async {
            live.shell.write_all(line.as_bytes()).await?;
            live.shell.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!("Shell write failed: {}", e);
            ConsoleError::ShellUnavailable
        })?;
        debug!("run_async_command: {}", command);
        Ok(())
    }

    /// Tear down shell and transport. Idempotent.
    pub async fn close(&self) {
        let previous = self.state.lock().await.take();
        if let Some(live) = previous {
            live.shutdown().await;
            info!("Session closed");
        }
        self.reset_details();
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|live| !live.transport.is_closed())
    }

    /// Shared handle to the live transport, if any
    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.state
            .lock()
            .await
            .as_ref()
            .filter(|live| !live.transport.is_closed())
            .map(|live| live.transport.clone())
    }

    /// Directory reported by `pwd` at login
    pub fn remote_working_dir(&self) -> Option<String> {
        self.remote_dir.read().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    fn reset_details(&self) {
        *self.remote_dir.write() = None;
        *self.username.write() = None;
    }
}
