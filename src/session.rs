use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::relay::{self, RelayReport};
use crate::request::{self, ParsedRequest};
use crate::wire::{self, HeaderField, CRLF};

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct SessionReport {
    pub request: ParsedRequest,
    pub relay: RelayReport,
}

/// Serves one accepted client connection from request line to teardown.
///
/// Any failure before the relay starts drops both sockets and returns the
/// error; nothing is written to the client in that case beyond what was
/// already flushed.
pub async fn handle_connection(
    client: TcpStream,
    client_addr: SocketAddr,
    config: &SessionConfig,
) -> Result<SessionReport> {
    let _ = client.set_nodelay(true);
    let (client_read, client_write) = client.into_split();
    let mut client_reader = BufReader::new(client_read);
    let mut client_writer = BufWriter::new(client_write);

    let first_line = wire::read_line(&mut client_reader).await?;
    let req = request::parse_request_line(&first_line)?;
    debug!(
        %client_addr,
        method = %req.method,
        scheme = %req.scheme,
        target = %req.authority(),
        origin_form = %req.origin_form(),
        "build request"
    );
    let client_headers = wire::read_headers(&mut client_reader).await?;

    let upstream = connect_upstream(&req, config.connect_timeout).await?;
    if let Ok(peer) = upstream.peer_addr() {
        info!("connected upstream {} ({}) for {}", req.authority(), peer, client_addr);
    }
    let (upstream_read, upstream_write) = upstream.into_split();
    let mut upstream_reader = BufReader::new(upstream_read);
    let mut upstream_writer = BufWriter::new(upstream_write);

    let upstream_limit = if req.is_connect() {
        respond_tunnel(&mut client_writer, &req).await?;
        None
    } else {
        forward_request(
            &mut client_reader,
            &mut upstream_writer,
            &req,
            &client_headers,
        )
        .await?;
        relay_response_head(&mut upstream_reader, &mut client_writer).await?
    };

    let relay = relay::relay(
        client_reader,
        client_writer,
        upstream_reader,
        upstream_writer,
        upstream_limit,
    )
    .await;
    info!(
        "closed {} <-> {} (sent={} received={})",
        client_addr,
        req.authority(),
        relay.client_to_upstream,
        relay.upstream_to_client
    );

    Ok(SessionReport { request: req, relay })
}

/// Opens the outbound connection named by the request.
pub async fn connect_upstream(
    req: &ParsedRequest,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let addr = req.authority();
    let connect_future = TcpStream::connect((req.host.as_str(), req.port));

    let connected = match connect_timeout {
        Some(limit) => match timeout(limit, connect_future).await {
            Ok(connected) => connected,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection within {:?}", limit),
            )),
        },
        None => connect_future.await,
    };

    let stream = connected.map_err(|source| ProxyError::UpstreamConnectFailed { addr, source })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Answers a `CONNECT` with `PROTOCOL 200 Connection established`.
pub async fn respond_tunnel<W>(client: &mut W, req: &ParsedRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!("{} 200 Connection established{CRLF}{CRLF}", req.protocol);
    client.write_all(response.as_bytes()).await?;
    client.flush().await?;
    Ok(())
}

/// Sends the request line, client headers and any `Content-Length` body
/// upstream.
pub async fn forward_request<R, W>(
    client: &mut R,
    upstream: &mut W,
    req: &ParsedRequest,
    headers: &[HeaderField],
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    request::write_request_line(upstream, req).await?;
    wire::write_headers(upstream, headers).await?;

    if let Some(expected) = wire::content_length(headers)? {
        let mut body = tokio::io::AsyncReadExt::take(&mut *client, expected);
        let received = tokio::io::copy(&mut body, upstream).await?;
        if received < expected {
            return Err(ProxyError::ShortBody { expected, received });
        }
        upstream.flush().await?;
        debug!(bytes = received, "forwarded request body");
    }
    Ok(())
}

/// Relays the upstream status line and headers to the client.
///
/// Returns the bound for the upstream to client relay: the response
/// `Content-Length`, or `None` to read until end-of-stream.
pub async fn relay_response_head<R, W>(upstream: &mut R, client: &mut W) -> Result<Option<u64>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let status_line = wire::read_line(upstream).await?;
    debug!(line = %status_line, "write first line to client response");
    client.write_all(status_line.as_bytes()).await?;
    client.write_all(CRLF.as_bytes()).await?;
    client.flush().await?;

    let headers = wire::read_headers(upstream).await?;
    wire::write_headers(client, &headers).await?;
    wire::content_length(&headers)
}
