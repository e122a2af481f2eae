//! Byte relay between a local socket and a forwarded channel

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    LocalClosed,
    RemoteClosed,
    Cancelled,
    Failed,
}

/// Copy bytes both ways until either side reads zero bytes, an I/O error
/// occurs or `cancel` fires. Both endpoints are shut down afterwards.
pub async fn relay<L, R>(
    local: &mut L,
    remote: &mut R,
    cancel: &CancellationToken,
) -> (RelayEnd, RelayStats)
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut stats = RelayStats::default();
    let mut local_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut remote_buf = vec![0u8; RELAY_BUFFER_SIZE];

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break RelayEnd::Cancelled,

            read = local.read(&mut local_buf) => match read {
                Ok(0) => break RelayEnd::LocalClosed,
                Ok(n) => {
                    if let Err(e) = remote.write_all(&local_buf[..n]).await {
                        debug!("Channel write error: {}", e);
                        break RelayEnd::Failed;
                    }
                    stats.bytes_to_remote += n as u64;
                }
                Err(e) => {
                    debug!("Local read error: {}", e);
                    break RelayEnd::Failed;
                }
            },

            read = remote.read(&mut remote_buf) => match read {
                Ok(0) => break RelayEnd::RemoteClosed,
                Ok(n) => {
                    if let Err(e) = local.write_all(&remote_buf[..n]).await {
                        debug!("Local write error: {}", e);
                        break RelayEnd::Failed;
                    }
                    stats.bytes_to_local += n as u64;
                }
                Err(e) => {
                    debug!("Channel read error: {}", e);
                    break RelayEnd::Failed;
                }
            },
        }
    };

    let _ = local.shutdown().await;
    let _ = remote.shutdown().await;

    (end, stats)
}
