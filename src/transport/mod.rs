pub mod doh;
pub mod tcp;
pub mod tls;
pub mod udp;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    TimedOut,
}

/// Parsed upstream address: `scheme://host[:port][/path]`, where scheme is
/// one of `udp`, `tcp`, `tls` (DoT), `https` (DoH).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
    /// Optional override for the socket address actually dialed, letting
    /// a DoH/DoT upstream pin its IP independent of the SNI/Host value.
    pub dial_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Udp,
    Tcp,
    Tls,
    Https,
}

impl UpstreamAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| anyhow!("upstream address missing scheme: {s}"))?;
        let scheme = match scheme_str {
            "udp" => Scheme::Udp,
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "https" => Scheme::Https,
            other => return Err(anyhow!("unsupported upstream scheme: {other}")),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, Some(format!("/{p}"))),
            None => (rest, None),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(default_port(scheme))),
            None => (authority.to_string(), default_port(scheme)),
        };
        Ok(Self {
            scheme,
            host,
            port,
            path,
            dial_addr: None,
        })
    }

    pub fn socket_addr_str(&self) -> String {
        self.dial_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

fn default_port(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Udp | Scheme::Tcp => 53,
        Scheme::Tls => 853,
        Scheme::Https => 443,
    }
}

/// Per-call transport context.
pub struct TransportCtx {
    pub timeout: Duration,
}

/// Common capability every upstream transport implements, the seam the
/// pipeline's forward step calls through regardless of protocol.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn exchange(&self, ctx: &TransportCtx, wire: &[u8]) -> Result<Bytes, TransportError>;
}
