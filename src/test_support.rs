//! In-process fakes for the SSH seam

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::config::Credentials;
use crate::error::ConsoleError;
use crate::ssh::{BoxedStream, CommandOutput, Connector, ShellWriter, Transport, INVALID_CREDENTIALS};

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse";

pub fn valid_credentials() -> Credentials {
    Credentials::new(USERNAME, PASSWORD)
}

/// Accepts exactly one username/password pair
#[derive(Default)]
pub struct FakeConnector {
    pub fail_shell: bool,
    /// `pwd` never completes
    pub hang_pwd: bool,
    pub fail_nodes: HashSet<String>,
    pub panic_nodes: HashSet<String>,
    pub connects: AtomicUsize,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>, ConsoleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if credentials.username != USERNAME || credentials.password != PASSWORD {
            return Err(ConsoleError::Authentication(INVALID_CREDENTIALS.to_string()));
        }
        let transport = Arc::new(FakeTransport {
            username: credentials.username.clone(),
            fail_shell: self.fail_shell,
            hang_pwd: self.hang_pwd,
            fail_nodes: self.fail_nodes.clone(),
            panic_nodes: self.panic_nodes.clone(),
            closed: AtomicBool::new(false),
            shell_peer: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Remote side simulated in memory. Forwarded channels echo their input.
pub struct FakeTransport {
    username: String,
    fail_shell: bool,
    hang_pwd: bool,
    fail_nodes: HashSet<String>,
    panic_nodes: HashSet<String>,
    closed: AtomicBool,
    shell_peer: Mutex<Option<DuplexStream>>,
    pub commands: Mutex<Vec<String>>,
    /// (host, port, originator host, originator port) per direct-tcpip open
    pub opened: Mutex<Vec<(String, u16, String, u16)>>,
}

impl FakeTransport {
    /// Remote end of the interactive shell
    pub fn take_shell_peer(&self) -> Option<DuplexStream> {
        self.shell_peer.lock().take()
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ConsoleError> {
        if self.is_closed() {
            return Err(ConsoleError::Connectivity("session closed".into()));
        }
        self.commands.lock().push(command.to_string());
        if command == "pwd" && self.hang_pwd {
            std::future::pending::<()>().await;
        }

        let output = if let Some(rest) = command.strip_prefix("echo ") {
            CommandOutput {
                stdout: format!("{}\n", rest),
                exit_code: Some(0),
                ..Default::default()
            }
        } else if command == "pwd" {
            CommandOutput {
                stdout: format!("/home/{}\n", self.username),
                exit_code: Some(0),
                ..Default::default()
            }
        } else {
            CommandOutput {
                stderr: format!("{}: command not found\n", command),
                exit_code: Some(127),
                ..Default::default()
            }
        };
        Ok(output)
    }

    async fn open_shell(&self) -> Result<ShellWriter, ConsoleError> {
        if self.fail_shell {
            return Err(ConsoleError::Connectivity("shell request refused".into()));
        }
        let (local, remote) = tokio::io::duplex(4096);
        *self.shell_peer.lock() = Some(remote);
        Ok(Box::new(local))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream, ConsoleError> {
        if self.panic_nodes.contains(host) {
            panic!("simulated worker fault for {}", host);
        }
        if self.is_closed() {
            return Err(ConsoleError::Connectivity("session closed".into()));
        }
        if self.fail_nodes.contains(host) {
            return Err(ConsoleError::Connectivity(format!(
                "channel open to {}:{} refused",
                host, port
            )));
        }
        self.opened.lock().push((
            host.to_string(),
            port,
            originator_host.to_string(),
            originator_port,
        ));

        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(local))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shell_peer.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
