use std::{io, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Copy bytes between two duplex streams, both directions concurrently,
/// until each direction reaches EOF or errors. Returns only once both
/// directions have completed; both streams are dropped together, never one
/// without the other. Copy errors are logged with the endpoint labels and
/// never propagated; once a tunnel is established there is no client
/// error channel left.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    client_label: String,
    upstream_label: String,
    idle_timeout: Option<Duration>,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (upstream_rd, upstream_wr) = tokio::io::split(upstream);

    let (sent, received) = tokio::join!(
        copy_half(client_rd, upstream_wr, idle_timeout),
        copy_half(upstream_rd, client_wr, idle_timeout),
    );

    match sent {
        Ok(n) => debug!(from = %client_label, to = %upstream_label, bytes = n, "relay direction done"),
        Err(e) => error!(from = %client_label, to = %upstream_label, "relay error: {e}"),
    }
    match received {
        Ok(n) => debug!(from = %upstream_label, to = %client_label, bytes = n, "relay direction done"),
        Err(e) => error!(from = %upstream_label, to = %client_label, "relay error: {e}"),
    }
    debug!(client = %client_label, upstream = %upstream_label, "tunnel closed");
}

/// One relay direction. On EOF the destination write half is shut down so
/// the far side observes the half-close.
async fn copy_half<R, W>(mut src: R, mut dst: W, idle_timeout: Option<Duration>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, src.read(&mut buf))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "relay idle deadline elapsed")
                })??,
            None => src.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.shutdown().await?;
    Ok(total)
}
