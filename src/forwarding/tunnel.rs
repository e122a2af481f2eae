//! Node Tunnel
//!
//! One local TCP listener whose accepted connections are forwarded through
//! the SSH session as `direct-tcpip` channels to a single `node:port`.
//! Each tunnel runs exactly one worker task. In [`RelayMode::Serial`] the
//! worker relays each client to completion before accepting the next; in
//! [`RelayMode::Concurrent`] it spawns one relay task per client.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::relay::{relay, RelayEnd};
use crate::config::{RelayMode, TunnelSettings};
use crate::error::ConsoleError;
use crate::ssh::Transport;

const LISTEN_BACKLOG: u32 = 8;

/// Display snapshot of a tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub node: String,
    pub local_port: u16,
    pub running: bool,
    pub active_channels: usize,
    pub total_connections: u64,
    pub opened_at: DateTime<Utc>,
}

/// What went wrong while tearing a tunnel down. Never blocks removal.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub channels_closed: usize,
    pub worker_joined: bool,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A forwarded channel currently being relayed
struct ChannelEntry {
    peer: SocketAddr,
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

/// State shared between the tunnel handle and its worker
#[derive(Default)]
struct TunnelShared {
    running: AtomicBool,
    channels: DashMap<u64, ChannelEntry>,
    next_channel_id: AtomicU64,
    total_connections: AtomicU64,
}

/// Clears `running` however the worker ends, including panics and aborts
struct RunningGuard(Arc<TunnelShared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

pub struct Tunnel {
    node: String,
    local_port: u16,
    opened_at: DateTime<Utc>,
    shared: Arc<TunnelShared>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Bind the local port and start the worker.
    /// `local_port == 0` binds an ephemeral port; [`Tunnel::local_port`] reports it.
    pub fn open(
        node: &str,
        local_port: u16,
        transport: Arc<dyn Transport>,
        settings: &TunnelSettings,
    ) -> Result<Self, ConsoleError> {
        let listener = bind_listener(&settings.bind_host, local_port)?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| ConsoleError::port_bind(local_port, &e))?
            .port();

        let shared = Arc::new(TunnelShared::default());
        shared.running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let worker = Worker {
            node: node.to_string(),
            remote_port: settings.remote_port,
            mode: settings.relay_mode,
            transport,
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(listener));

        info!(
            "Tunnel listening on {}:{} -> {}:{} ({:?})",
            settings.bind_host, bound_port, node, settings.remote_port, settings.relay_mode
        );

        Ok(Self {
            node: node.to_string(),
            local_port: bound_port,
            opened_at: Utc::now(),
            shared,
            cancel,
            worker: Some(handle),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Worker still accepting
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn active_channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            node: self.node.clone(),
            local_port: self.local_port,
            running: self.is_running(),
            active_channels: self.active_channels(),
            total_connections: self.shared.total_connections.load(Ordering::SeqCst),
            opened_at: self.opened_at,
        }
    }

    /// Close open channels, stop accepting and wait up to `join_timeout`
    /// for the worker. The worker is aborted if it does not exit in time.
    pub async fn shutdown(mut self, join_timeout: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();

        for entry in self.shared.channels.iter() {
            debug!(
                "Closing channel {} from {} (open since {})",
                entry.key(),
                entry.peer,
                entry.opened_at
            );
            entry.cancel.cancel();
            report.channels_closed += 1;
        }

        self.cancel.cancel();

        if let Some(mut worker) = self.worker.take() {
            match tokio::time::timeout(join_timeout, &mut worker).await {
                Ok(Ok(())) => report.worker_joined = true,
                Ok(Err(e)) => {
                    report.worker_joined = true;
                    report.errors.push(format!("worker for {} failed: {}", self.node, e));
                }
                Err(_) => {
                    worker.abort();
                    report.errors.push(format!(
                        "worker for {} did not stop within {}ms, aborted",
                        self.node,
                        join_timeout.as_millis()
                    ));
                    // Wait for the abort so the listener is dropped before returning
                    let _ = worker.await;
                }
            }
        }

        self.shared.channels.clear();

        if report.is_clean() {
            info!("Tunnel to {} on port {} closed", self.node, self.local_port);
        } else {
            for err in &report.errors {
                warn!("Tunnel teardown: {}", err);
            }
        }
        report
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_listener(bind_host: &str, port: u16) -> Result<TcpListener, ConsoleError> {
    let ip: IpAddr = bind_host.parse().map_err(|_| {
        ConsoleError::Configuration(format!("Invalid tunnel bind address: {}", bind_host))
    })?;
    let addr = SocketAddr::new(ip, port);

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| ConsoleError::port_bind(port, &e))?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| ConsoleError::port_bind(port, &e))?;
    socket
        .bind(addr)
        .map_err(|e| ConsoleError::port_bind(port, &e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ConsoleError::port_bind(port, &e))
}

struct Worker {
    node: String,
    remote_port: u16,
    mode: RelayMode,
    transport: Arc<dyn Transport>,
    shared: Arc<TunnelShared>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, listener: TcpListener) {
        let _running = RunningGuard(self.shared.clone());
        let mut relays: JoinSet<()> = JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(done) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = done {
                        warn!("Relay task for {} failed: {}", self.node, e);
                    }
                    continue;
                }

                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Stopping tunnel to {}: accept failed: {}", self.node, e);
                        break;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }
            debug!("Accepted {} for tunnel to {}", peer, self.node);

            let peer_host = peer.ip().to_string();
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.transport.open_direct_tcpip(
                    &self.node,
                    self.remote_port,
                    &peer_host,
                    peer.port(),
                ) => opened,
            };

            let remote = match opened {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(
                        "Stopping tunnel to {}: cannot open channel to {}:{}: {}",
                        self.node, self.node, self.remote_port, e
                    );
                    break;
                }
            };

            self.shared.total_connections.fetch_add(1, Ordering::SeqCst);
            let id = self.shared.next_channel_id.fetch_add(1, Ordering::SeqCst);
            let channel_cancel = self.cancel.child_token();
            self.shared.channels.insert(
                id,
                ChannelEntry {
                    peer,
                    cancel: channel_cancel.clone(),
                    opened_at: Utc::now(),
                },
            );

            let connection = Connection {
                id,
                node: self.node.clone(),
                peer,
                shared: self.shared.clone(),
                cancel: channel_cancel,
            };

            match self.mode {
                RelayMode::Serial => connection.serve(stream, remote).await,
                RelayMode::Concurrent => {
                    relays.spawn(connection.serve(stream, remote));
                }
            }
        }

        relays.shutdown().await;
        info!("Tunnel worker for {} exited", self.node);
    }
}

/// One accepted client and its forwarded channel
struct Connection {
    id: u64,
    node: String,
    peer: SocketAddr,
    shared: Arc<TunnelShared>,
    cancel: CancellationToken,
}

impl Connection {
    async fn serve(self, mut stream: TcpStream, mut remote: crate::ssh::BoxedStream) {
        let (end, stats) = relay(&mut stream, &mut *remote, &self.cancel).await;
        self.shared.channels.remove(&self.id);

        match end {
            RelayEnd::Failed => warn!(
                "Relay {} -> {} ended with an I/O error after {}/{} bytes",
                self.peer, self.node, stats.bytes_to_remote, stats.bytes_to_local
            ),
            _ => debug!(
                "Relay {} -> {} finished ({:?}): {} bytes out, {} bytes in",
                self.peer, self.node, end, stats.bytes_to_remote, stats.bytes_to_local
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::ssh::Connector;
    use crate::test_support::{valid_credentials, FakeConnector, FakeTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn fake_transport(connector: &FakeConnector) -> (Arc<dyn Transport>, Arc<FakeTransport>) {
        let creds: Credentials = valid_credentials();
        let transport = connector.connect(&creds).await.unwrap();
        (transport, connector.last_transport().unwrap())
    }

    fn settings(mode: RelayMode) -> TunnelSettings {
        TunnelSettings {
            relay_mode: mode,
            ..Default::default()
        }
    }

    async fn echo_roundtrip(port: u16, payload: &[u8]) -> TcpStream {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, payload);
        client
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_port_and_originator() {
        let connector = FakeConnector::new();
        let (transport, fake) = fake_transport(&connector).await;
        let tunnel = Tunnel::open("node-a", 0, transport, &settings(RelayMode::Serial)).unwrap();
        assert_ne!(tunnel.local_port(), 0);

        let client = echo_roundtrip(tunnel.local_port(), b"hello").await;
        let local = client.local_addr().unwrap();

        let opened = fake.opened.lock().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, "node-a");
        assert_eq!(opened[0].1, 22);
        assert_eq!(opened[0].2, "127.0.0.1");
        assert_eq!(opened[0].3, local.port());

        let info = tunnel.info();
        assert!(info.running);
        assert_eq!(info.total_connections, 1);
        assert_eq!(info.active_channels, 1);

        drop(client);
        wait_until(|| tunnel.active_channels() == 0).await;
        let report = tunnel.shutdown(Duration::from_secs(1)).await;
        assert!(report.is_clean());
        assert!(report.worker_joined);
    }

    #[tokio::test]
    async fn test_serial_mode_serves_one_client_at_a_time() {
        let connector = FakeConnector::new();
        let (transport, fake) = fake_transport(&connector).await;
        let tunnel = Tunnel::open("node-a", 0, transport, &settings(RelayMode::Serial)).unwrap();
        let port = tunnel.local_port();

        let first = echo_roundtrip(port, b"first").await;

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        second.write_all(b"second").await.unwrap();
        let mut buf = [0u8; 6];
        let waited =
            tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut buf)).await;
        assert!(waited.is_err(), "second client served while first active");
        assert_eq!(fake.opened_count(), 1);

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"second");
        assert_eq!(fake.opened_count(), 2);

        tunnel.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_concurrent_mode_serves_clients_together() {
        let connector = FakeConnector::new();
        let (transport, fake) = fake_transport(&connector).await;
        let tunnel =
            Tunnel::open("node-a", 0, transport, &settings(RelayMode::Concurrent)).unwrap();
        let port = tunnel.local_port();

        let first = echo_roundtrip(port, b"first").await;
        let second = echo_roundtrip(port, b"second").await;
        assert_eq!(fake.opened_count(), 2);
        wait_until(|| tunnel.active_channels() == 2).await;

        let report = tunnel.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.channels_closed, 2);
        assert!(report.is_clean());
        drop((first, second));
    }

    #[tokio::test]
    async fn test_failed_channel_open_stops_worker() {
        let mut connector = FakeConnector::new();
        connector.fail_nodes.insert("node-down".into());
        let (transport, _) = fake_transport(&connector).await;
        let tunnel = Tunnel::open("node-down", 0, transport, &settings(RelayMode::Serial)).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        // Worker drops the accepted socket when the channel cannot be opened
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        wait_until(|| !tunnel.is_running()).await;
        let report = tunnel.shutdown(Duration::from_secs(1)).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_closed_transport_stops_worker() {
        let connector = FakeConnector::new();
        let (transport, fake) = fake_transport(&connector).await;
        let tunnel = Tunnel::open("node-a", 0, transport, &settings(RelayMode::Serial)).unwrap();

        fake.close().await;
        let _client = TcpStream::connect(("127.0.0.1", tunnel.local_port()))
            .await
            .unwrap();
        wait_until(|| !tunnel.is_running()).await;
        tunnel.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_bind_host() {
        let connector = FakeConnector::new();
        let (transport, _) = fake_transport(&connector).await;
        let settings = TunnelSettings {
            bind_host: "not-an-address".into(),
            ..Default::default()
        };
        assert!(matches!(
            Tunnel::open("node-a", 0, transport, &settings),
            Err(ConsoleError::Configuration(_))
        ));
    }
}
