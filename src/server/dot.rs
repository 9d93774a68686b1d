//! DNS-over-TLS front-end: the same length-prefixed framing as plain TCP
//! (spec.md §4.8), wrapped in a TLS accept step. TLS server setup is
//! grounded on a DoT reference implementation's rustls wiring, reusing
//! this crate's own DoT *client* transport's rustls version (`transport::tls`)
//! and the generic length-prefixed framing from `wire::generic`.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::wire::generic::{read_framed, write_framed};

use super::serve_query;
use super::tcp::{ACCEPT_ERROR_BACKOFF, IDLE_TIMEOUT, WRITE_TIMEOUT};

pub async fn spawn(addr: SocketAddr, cert_path: &str, key_path: &str, engine: Engine) -> Result<tokio::task::JoinHandle<()>> {
    let config = load_server_config(cert_path, key_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind(addr).await?;
    let engine = engine.with_listener_label("dot");
    Ok(tokio::spawn(accept_loop(listener, acceptor, engine)))
}

pub(crate) fn load_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let cert_file = File::open(cert_path).with_context(|| format!("open tls cert: {cert_path}"))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .context("parse tls certs")?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {cert_path}"));
    }

    let key_file = File::open(key_path).with_context(|| format!("open tls key: {key_path}"))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
        .context("parse tls private key")?;
    let key = keys
        .pop()
        .ok_or_else(|| anyhow!("no pkcs8 private key found in {key_path}"))?;

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(key))
        .context("build tls server config")
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, engine: Engine) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(acceptor, stream, peer, engine).await {
                        debug!(%peer, error = %err, "dot connection ended");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "dot accept failed, backing off");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn handle_conn(acceptor: TlsAcceptor, stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("tls handshake")?;
    let (read_half, write_half) = tokio::io::split(tls_stream);
    let write_half = Arc::new(Mutex::new(write_half));
    let mut read_half = read_half;

    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, read_framed(&mut read_half)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => break,
            Err(_) => break,
        };

        let engine = engine.clone();
        let write_half = write_half.clone();
        tokio::spawn(async move {
            if let Some(resp) = serve_query(&engine, &frame, peer.ip(), true).await {
                let mut guard = write_half.lock().await;
                if tokio::time::timeout(WRITE_TIMEOUT, write_framed(&mut *guard, &resp))
                    .await
                    .is_err()
                {
                    warn!(%peer, "dot response write timed out");
                }
            }
        });
    }

    Ok(())
}
