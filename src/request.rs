use http::Uri;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::wire::CRLF;

pub const CONNECT_METHOD: &str = "CONNECT";
const DEFAULT_PORT: u16 = 80;

/// First line of a client request, split into the parts the proxy needs.
///
/// `scheme`, `path` and `query` stay empty for `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: String,
    pub protocol: String,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method == CONNECT_METHOD
    }

    /// `host:port` used to dial the upstream.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Origin-form target sent upstream: path (default `/`) plus `?query`.
    pub fn origin_form(&self) -> String {
        let mut target = if self.path.is_empty() {
            String::from("/")
        } else {
            self.path.clone()
        };
        if !self.query.is_empty() {
            target.push('?');
            target.push_str(&self.query);
        }
        target
    }
}

/// Parses `METHOD target PROTOCOL`.
///
/// Fields are separated by single spaces; anything after the third field is
/// ignored.
pub fn parse_request_line(line: &str) -> Result<ParsedRequest> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 3 {
        return Err(ProxyError::InvalidRequestLine(line.to_string()));
    }
    let (method, target, protocol) = (fields[0], fields[1], fields[2]);

    if method == CONNECT_METHOD {
        let (host, port) = parse_authority(target)?;
        return Ok(ParsedRequest {
            method: method.to_string(),
            scheme: String::new(),
            host,
            port,
            path: String::new(),
            query: String::new(),
            protocol: protocol.to_string(),
        });
    }

    let uri: Uri = target
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(target.to_string()))?;
    let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    };

    // userinfo is not part of the dial address
    let host_port = match authority.as_str().rsplit_once('@') {
        Some((_, host_port)) => host_port,
        None => authority.as_str(),
    };
    let (host, port) = parse_authority(host_port)?;

    Ok(ParsedRequest {
        method: method.to_string(),
        scheme: scheme.to_string(),
        host,
        port,
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        protocol: protocol.to_string(),
    })
}

/// Splits `host[:port]`; the port defaults to 80.
///
/// More than one colon is rejected, so bracketed IPv6 literals are not
/// supported.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let segments: Vec<&str> = authority.split(':').collect();
    let (host, port) = match segments.as_slice() {
        [host] => (*host, DEFAULT_PORT),
        [host, port] => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ProxyError::InvalidPort(port.to_string()))?;
            (*host, port)
        }
        _ => return Err(ProxyError::InvalidHost(authority.to_string())),
    };

    if host.is_empty() {
        return Err(ProxyError::InvalidHost(authority.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Writes `METHOD origin-form PROTOCOL\r\n` without flushing.
pub async fn write_request_line<W>(writer: &mut W, req: &ParsedRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{} {} {}{CRLF}", req.method, req.origin_form(), req.protocol);
    debug!(line = %line.trim_end(), "write upstream first line");
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let req = parse_request_line("GET http://www.google.com?k=v&b=1 HTTP/1.1").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.scheme, "http");
        assert_eq!(req.host, "www.google.com");
        assert_eq!(req.port, 80);
        assert_eq!(req.query, "k=v&b=1");
        assert_eq!(req.protocol, "HTTP/1.1");

        let req =
            parse_request_line("POST http://www.google.com:8888/?k=%E4%BD%A0%E5%A5%BD HTTP/1.1")
                .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.host, "www.google.com");
        assert_eq!(req.port, 8888);
        assert_eq!(req.path, "/");
        assert_eq!(req.query, "k=%E4%BD%A0%E5%A5%BD");
    }

    #[test]
    fn test_parse_connect_request() {
        let req = parse_request_line("CONNECT www.google.com:443 HTTP/1.0").unwrap();
        assert!(req.is_connect());
        assert_eq!(req.host, "www.google.com");
        assert_eq!(req.port, 443);
        assert_eq!(req.protocol, "HTTP/1.0");
        assert!(req.scheme.is_empty());
        assert!(req.path.is_empty());
        assert!(req.query.is_empty());
        assert_eq!(req.authority(), "www.google.com:443");
    }

    #[test]
    fn test_parse_request_line_missing_field() {
        assert!(matches!(
            parse_request_line("GET HTTP/1.1").unwrap_err(),
            ProxyError::InvalidRequestLine(_)
        ));
        assert!(matches!(
            parse_request_line("").unwrap_err(),
            ProxyError::InvalidRequestLine(_)
        ));
    }

    #[test]
    fn test_parse_request_line_relative_target() {
        assert!(matches!(
            parse_request_line("GET /index.html HTTP/1.1").unwrap_err(),
            ProxyError::InvalidTarget(_)
        ));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(parse_authority("example.com").unwrap(), ("example.com".into(), 80));
        assert_eq!(parse_authority("example.com:8080").unwrap(), ("example.com".into(), 8080));
        assert!(matches!(
            parse_authority("example.com:https").unwrap_err(),
            ProxyError::InvalidPort(_)
        ));
        assert!(matches!(
            parse_authority("example.com:0").unwrap_err(),
            ProxyError::InvalidPort(_)
        ));
        assert!(matches!(
            parse_authority("example.com:70000").unwrap_err(),
            ProxyError::InvalidPort(_)
        ));
        assert!(matches!(
            parse_authority("[::1]:443").unwrap_err(),
            ProxyError::InvalidHost(_)
        ));
        assert!(matches!(
            parse_authority(":443").unwrap_err(),
            ProxyError::InvalidHost(_)
        ));
    }

    #[test]
    fn test_connect_with_bad_port() {
        assert!(matches!(
            parse_request_line("CONNECT example.com:abc HTTP/1.1").unwrap_err(),
            ProxyError::InvalidPort(_)
        ));
    }

    #[test]
    fn test_userinfo_is_not_part_of_host() {
        let req = parse_request_line("GET http://user@example.com:81/a HTTP/1.1").unwrap();
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 81);
    }

    #[tokio::test]
    async fn test_write_request_line() {
        let cases = [
            ("GET http://example.com/path?x=1 HTTP/1.1", "GET /path?x=1 HTTP/1.1\r\n"),
            ("GET http://www.google.com?k=v&b=1 HTTP/1.1", "GET /?k=v&b=1 HTTP/1.1\r\n"),
            ("HEAD http://example.com HTTP/1.0", "HEAD / HTTP/1.0\r\n"),
            ("DELETE http://example.com:8080/a/b/ HTTP/1.1", "DELETE /a/b/ HTTP/1.1\r\n"),
        ];
        for (line, expected) in cases {
            let req = parse_request_line(line).unwrap();
            let mut out = Vec::new();
            write_request_line(&mut out, &req).await.unwrap();
            assert_eq!(String::from_utf8(out).unwrap(), expected, "line: {line}");
        }
    }

    #[test]
    fn test_origin_form_defaults_to_root() {
        let req = ParsedRequest {
            method: "GET".into(),
            scheme: "http".into(),
            host: "example.com".into(),
            port: 80,
            path: String::new(),
            query: "q=1".into(),
            protocol: "HTTP/1.1".into(),
        };
        assert_eq!(req.origin_form(), "/?q=1");
    }
}
