use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Bidirectional byte pump between `client` (side A) and `remote` (side B).
/// Two cooperative pumps share one cancellation token: whichever direction
/// sees EOF, an error, or `idle_timeout` of silence shuts its write half
/// down and cancels the token, which unblocks the other pump within at
/// most one more idle interval. Ordering within a single direction is
/// preserved by construction (one `read`/`write_all` pair at a time); no
/// ordering is implied between directions.
pub async fn run<A, B>(client: A, remote: B, idle_timeout: Duration) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);
    let cancel = CancellationToken::new();

    let up = pump(&mut client_r, &mut remote_w, idle_timeout, cancel.clone());
    let down = pump(&mut remote_r, &mut client_w, idle_timeout, cancel.clone());

    let (bytes_up, bytes_down) = tokio::join!(up, down);
    RelayStats { bytes_up, bytes_down }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Duration, cancel: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => {
                let n = match result {
                    Err(_elapsed) => break,
                    Ok(Err(_io_err)) => break,
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                };
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }
    cancel.cancel();
    let _ = writer.shutdown().await;
    total
}
