//! Upstream registry: lazily constructs and caches one `Upstream` transport
//! per distinct endpoint string, selecting UDP/TCP/TLS/DoH and (for
//! TCP/TLS) the no-reuse/sequential/pipelined mode from global settings, as
//! spec.md §4.5's mode-selection table.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::config::GlobalSettings;
use crate::transport::doh::DohTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Scheme, Upstream, UpstreamAddr};

pub struct UpstreamRegistry {
    cache: DashMap<String, Arc<dyn Upstream>, FxBuildHasher>,
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self {
            cache: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached transport for `addr_str`, constructing it (and
    /// dialing its first connections lazily, on first query) if absent.
    pub async fn get_or_build(
        &self,
        addr_str: &str,
        settings: &GlobalSettings,
    ) -> Result<Arc<dyn Upstream>> {
        if let Some(existing) = self.cache.get(addr_str) {
            return Ok(existing.clone());
        }
        let built = build_transport(addr_str, settings).await?;
        self.cache.insert(addr_str.to_string(), built.clone());
        Ok(built)
    }
}

async fn build_transport(addr_str: &str, settings: &GlobalSettings) -> Result<Arc<dyn Upstream>> {
    let addr = UpstreamAddr::parse(addr_str)
        .with_context(|| format!("parse upstream address: {addr_str}"))?;

    match addr.scheme {
        Scheme::Udp => {
            let socket_addr = resolve(&addr)?;
            let tcp_fallback = Arc::new(build_tcp(&addr, socket_addr, settings));
            let udp = UdpTransport::new(socket_addr, settings.udp_pool_size.max(1), tcp_fallback)
                .await
                .context("build udp upstream")?;
            Ok(Arc::new(udp))
        }
        Scheme::Tcp => {
            let socket_addr = resolve(&addr)?;
            Ok(Arc::new(build_tcp(&addr, socket_addr, settings)))
        }
        Scheme::Tls => {
            let socket_addr = resolve(&addr)?;
            let tls = TlsTransport::new(socket_addr, &addr.host).context("build tls upstream")?;
            Ok(Arc::new(tls))
        }
        Scheme::Https => {
            let url = format!(
                "https://{}{}",
                addr.host,
                addr.path.as_deref().unwrap_or("/dns-query")
            );
            let doh = DohTransport::new(url).context("build doh upstream")?;
            Ok(Arc::new(doh))
        }
    }
}

fn build_tcp(_addr: &UpstreamAddr, socket_addr: SocketAddr, settings: &GlobalSettings) -> TcpTransport {
    if settings.upstream_idle_timeout_ms <= 0 {
        TcpTransport::no_reuse(socket_addr)
    } else if settings.upstream_pipeline_enabled {
        TcpTransport::pipelined(socket_addr, settings.tcp_pool_size.max(1))
    } else {
        TcpTransport::sequential(socket_addr)
    }
}

fn resolve(addr: &UpstreamAddr) -> Result<SocketAddr> {
    addr.socket_addr_str()
        .to_socket_addrs()
        .with_context(|| format!("resolve upstream address: {}", addr.socket_addr_str()))?
        .next()
        .ok_or_else(|| anyhow!("no addresses for upstream: {}", addr.socket_addr_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_numeric_address() {
        let addr = UpstreamAddr::parse("udp://1.1.1.1:53").unwrap();
        let sock = resolve(&addr).unwrap();
        assert_eq!(sock.port(), 53);
    }
}
