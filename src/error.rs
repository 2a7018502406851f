use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("line is not terminated by CRLF: {0:?}")]
    MalformedLine(String),

    #[error("request line invalid: {0:?}")]
    InvalidRequestLine(String),

    #[error("request target invalid: {0:?}")]
    InvalidTarget(String),

    #[error("host invalid: {0:?}")]
    InvalidHost(String),

    #[error("port must be an integer in 1..=65535: {0:?}")]
    InvalidPort(String),

    #[error("header line must be [name: value] format, got {0:?}")]
    MalformedHeader(String),

    #[error("request body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },

    #[error("content length value invalid: {0:?}")]
    InvalidContentLength(String),

    #[error("connect upstream {addr} failed: {source}")]
    UpstreamConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("stream closed")]
    StreamClosed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
