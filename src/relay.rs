use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, error};

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// Source reached end-of-stream.
    Eof,
    /// The byte bound was reached.
    Limit,
    /// The upstream socket was closed because the client finished first.
    UpstreamClosed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Copies `source` into `dest`, flushing after every chunk.
///
/// With `limit == None` the copy runs until end-of-stream. With `Some(n)`
/// it stops after exactly `n` bytes and never reads past them; reaching
/// end-of-stream before `n` bytes is an `UnexpectedEof` error. `copied` is
/// advanced as bytes are written, so it stays accurate if the future is
/// dropped or fails midway.
pub async fn transfer<R, W>(
    source: &mut R,
    dest: &mut W,
    limit: Option<u64>,
    copied: &mut u64,
) -> io::Result<TransferEnd>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let want = match limit {
            Some(limit) if bytes >= limit => return Ok(TransferEnd::Limit),
            Some(limit) => (limit - bytes).min(buf.len() as u64) as usize,
            None => buf.len(),
        };

        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            if let Some(limit) = limit {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} bytes", bytes, limit),
                ));
            }
            return Ok(TransferEnd::Eof);
        }

        dest.write_all(&buf[..n]).await?;
        dest.flush().await?;
        bytes += n as u64;
        *copied += n as u64;
    }
}

/// Runs both relay directions as separate tasks and closes every half once
/// both have finished.
///
/// Client end-of-stream shuts down the upstream write half and stops the
/// upstream read loop; a tunnel whose upstream never closes would otherwise
/// keep the reverse direction blocked forever. This applies to bounded
/// response bodies too: a body still in flight when the client finishes is
/// cut off at whatever has been relayed so far.
pub async fn relay<CR, CW, UR, UW>(
    mut client_reader: CR,
    mut client_writer: CW,
    mut upstream_reader: UR,
    mut upstream_writer: UW,
    upstream_limit: Option<u64>,
) -> RelayReport
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let (closed_tx, closed_rx) = oneshot::channel::<()>();

    let client_to_upstream = tokio::spawn(async move {
        let mut bytes = 0u64;
        match transfer(&mut client_reader, &mut upstream_writer, None, &mut bytes).await {
            Ok(_) => {
                debug!(bytes, "transferred all data from client");
                let _ = upstream_writer.shutdown().await;
                let _ = closed_tx.send(());
            }
            Err(e) => error!("transfer data from client to upstream failed: {}", e),
        }
        (bytes, client_reader, upstream_writer)
    });

    let upstream_to_client = tokio::spawn(async move {
        let mut bytes = 0u64;
        let result = tokio::select! {
            result = transfer(&mut upstream_reader, &mut client_writer, upstream_limit, &mut bytes) => result,
            Ok(()) = closed_rx => Ok(TransferEnd::UpstreamClosed),
        };
        match result {
            Ok(end) => debug!(bytes, ?end, "transferred data from upstream to client"),
            Err(e) => error!("transfer data from upstream to client failed: {}", e),
        }
        (bytes, upstream_reader, client_writer)
    });

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
    let mut report = RelayReport::default();

    match sent {
        Ok((bytes, _client_reader, mut upstream_writer)) => {
            report.client_to_upstream = bytes;
            let _ = upstream_writer.shutdown().await;
        }
        Err(e) => error!("client to upstream relay task failed: {}", e),
    }
    match received {
        Ok((bytes, _upstream_reader, mut client_writer)) => {
            report.upstream_to_client = bytes;
            let _ = client_writer.shutdown().await;
        }
        Err(e) => error!("upstream to client relay task failed: {}", e),
    }

    report
}
