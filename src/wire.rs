use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ProxyError, Result};

pub const CRLF: &str = "\r\n";

const MAX_LINE_LENGTH: u64 = 64 * 1024;

/// Hop-by-hop header dropped while reading a header block.
const CONNECTION_HEADER: &str = "Connection";
const CONTENT_LENGTH_HEADER: &str = "Content-Length";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn parse(line: &str) -> Result<Self> {
        match line.split_once(": ") {
            Some((name, value)) => Ok(Self::new(name, value)),
            None => Err(ProxyError::MalformedHeader(line.to_string())),
        }
    }
}

/// Reads one CRLF-terminated line and returns it without the terminator.
///
/// End-of-stream before a `\n` is reported as [`ProxyError::StreamClosed`];
/// a line that ends in a bare `\n`, or exceeds 64 KiB, is
/// [`ProxyError::MalformedLine`].
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(128);
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH)
        .read_until(b'\n', &mut raw)
        .await?;

    if n as u64 == MAX_LINE_LENGTH && raw.last() != Some(&b'\n') {
        return Err(ProxyError::MalformedLine(
            String::from_utf8_lossy(&raw[..64]).into_owned(),
        ));
    }
    if raw.last() != Some(&b'\n') {
        return Err(ProxyError::StreamClosed);
    }
    if raw.len() < 2 || !raw.ends_with(CRLF.as_bytes()) {
        return Err(ProxyError::MalformedLine(
            String::from_utf8_lossy(&raw).into_owned(),
        ));
    }

    raw.truncate(raw.len() - 2);
    String::from_utf8(raw)
        .map_err(|e| ProxyError::MalformedLine(String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

/// Reads `Name: Value` lines up to the blank terminator line.
///
/// Order and duplicates are preserved. A header named exactly `Connection`
/// is parsed but not returned: sessions are never reused, so it is not
/// forwarded. Other spellings such as `connection` pass through.
pub async fn read_headers<R>(reader: &mut R) -> Result<Vec<HeaderField>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }

        let header = HeaderField::parse(&line)?;
        if header.name == CONNECTION_HEADER {
            debug!(value = %header.value, "dropping hop-by-hop Connection header");
            continue;
        }
        debug!(name = %header.name, value = %header.value, "receive header");
        headers.push(header);
    }
}

/// Writes each header as `name: value\r\n`, the blank terminator line, then
/// flushes.
pub async fn write_headers<W>(writer: &mut W, headers: &[HeaderField]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for header in headers {
        let line = format!("{}: {}{CRLF}", header.name, header.value);
        writer.write_all(line.as_bytes()).await?;
    }
    writer.write_all(CRLF.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Value of the first `Content-Length` header, if any.
pub fn content_length(headers: &[HeaderField]) -> Result<Option<u64>> {
    let Some(header) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(CONTENT_LENGTH_HEADER))
    else {
        return Ok(None);
    };

    header
        .value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ProxyError::InvalidContentLength(header.value.clone()))
}
