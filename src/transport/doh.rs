use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::Client;

use super::{TransportCtx, TransportError, Upstream};

/// Internal deadline override (RFC 8484 §4.1 implementation note, spec.md
/// §4.5): closing the HTTP/2 connection mid-response to honor a caller's
/// shorter deadline would wipe out connection reuse for every other query
/// sharing it, so DoH always races against its own 5s cap instead of the
/// caller's.
const DOH_INTERNAL_DEADLINE: Duration = Duration::from_secs(5);

/// DNS-over-HTTPS (RFC 8484) upstream. The query's transaction id is
/// zeroed on the wire, base64url-encoded (no padding) and sent as a GET
/// `?dns=` query parameter; the original id is restored on the response
/// before returning.
pub struct DohTransport {
    client: Client,
    url: String,
}

impl DohTransport {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .http2_prior_knowledge()
            .timeout(DOH_INTERNAL_DEADLINE)
            .build()
            .context("build DoH http client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Upstream for DohTransport {
    async fn exchange(&self, _ctx: &TransportCtx, wire: &[u8]) -> Result<Bytes, TransportError> {
        if wire.len() < 2 {
            return Err(TransportError::Protocol("packet too short".into()));
        }
        let orig_id = [wire[0], wire[1]];
        let mut zeroed = wire.to_vec();
        zeroed[0] = 0;
        zeroed[1] = 0;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&zeroed);

        let resp = tokio::time::timeout(
            DOH_INTERNAL_DEADLINE,
            self.client
                .get(&self.url)
                .query(&[("dns", encoded)])
                .header("accept", "application/dns-message")
                .send(),
        )
        .await
        .map_err(|_| TransportError::TimedOut)?
        .map_err(|e| TransportError::Protocol(format!("doh request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "doh upstream returned status {}",
                resp.status()
            )));
        }
        let mut body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Protocol(format!("doh body read failed: {e}")))?
            .to_vec();
        if body.len() >= 2 {
            body[0] = orig_id[0];
            body[1] = orig_id[1];
        }
        Ok(Bytes::from(body))
    }
}
