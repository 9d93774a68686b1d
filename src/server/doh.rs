//! DNS-over-HTTPS front-end (RFC 8484), spec.md §4.8. Supports both the
//! GET `?dns=<base64url>` and POST `application/dns-message` request
//! forms; TLS terminates the same way as `server::dot`, with each
//! accepted connection handed to hyper's low-level `Http` connection
//! driver (hyper 0.14's `Server::bind` doesn't accept pre-wrapped TLS
//! streams directly, so the accept loop manages TLS itself).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use bytes::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::engine::Engine;

use super::serve_query;
use super::dot::load_server_config;
use super::tcp::ACCEPT_ERROR_BACKOFF;

const DNS_MESSAGE_MIME: &str = "application/dns-message";
/// RFC 1035 §4.2.2 frame ceiling, applied to the request body regardless
/// of transport so a DoH POST can't smuggle an oversized message past the
/// limits plain TCP/DoT enforce via 2-byte length prefixes.
const MAX_BODY_BYTES: usize = 65535;

pub async fn spawn(addr: SocketAddr, cert_path: &str, key_path: &str, engine: Engine) -> Result<tokio::task::JoinHandle<()>> {
    let config = load_server_config(cert_path, key_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind(addr).await?;
    let engine = engine.with_listener_label("doh");
    Ok(tokio::spawn(accept_loop(listener, acceptor, engine)))
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, engine: Engine) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(acceptor, stream, peer, engine).await {
                        debug!(%peer, error = %err, "doh connection ended");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "doh accept failed, backing off");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn handle_conn(acceptor: TlsAcceptor, stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("tls handshake")?;
    let service = service_fn(move |req| {
        let engine = engine.clone();
        async move { Ok::<_, Infallible>(handle_request(req, engine, peer).await) }
    });
    hyper::server::conn::Http::new()
        .serve_connection(tls_stream, service)
        .await
        .context("http connection error")
}

async fn handle_request(req: Request<Body>, engine: Engine, peer: SocketAddr) -> Response<Body> {
    let query = match extract_query(req).await {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match serve_query(&engine, &query, peer.ip(), true).await {
        Some(wire) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .body(Body::from(wire))
            .unwrap_or_else(|_| internal_error()),
        None => Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::empty())
            .unwrap_or_else(|_| internal_error()),
    }
}

async fn extract_query(req: Request<Body>) -> std::result::Result<Bytes, Response<Body>> {
    let accept_ok = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(DNS_MESSAGE_MIME) || v.contains("*/*"))
        .unwrap_or(true);
    if !accept_ok {
        return Err(status_only(StatusCode::NOT_ACCEPTABLE));
    }

    match *req.method() {
        Method::GET => {
            let query = req.uri().query().unwrap_or("");
            let encoded = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("dns="))
                .ok_or_else(|| status_only(StatusCode::BAD_REQUEST))?;
            let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| status_only(StatusCode::BAD_REQUEST))?;
            if decoded.len() > MAX_BODY_BYTES {
                return Err(status_only(StatusCode::PAYLOAD_TOO_LARGE));
            }
            Ok(Bytes::from(decoded))
        }
        Method::POST => {
            let content_type_ok = req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == DNS_MESSAGE_MIME)
                .unwrap_or(false);
            if !content_type_ok {
                return Err(status_only(StatusCode::UNSUPPORTED_MEDIA_TYPE));
            }
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(|_| status_only(StatusCode::BAD_REQUEST))?;
            if body.len() > MAX_BODY_BYTES {
                return Err(status_only(StatusCode::PAYLOAD_TOO_LARGE));
            }
            Ok(body)
        }
        _ => Err(status_only(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response<Body> {
    Response::new(Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_wire() -> Vec<u8> {
        b"\x00\x01\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00".to_vec()
    }

    #[tokio::test]
    async fn get_request_decodes_dns_query_param() {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sample_wire());
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/dns-query?dns={encoded}"))
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .body(Body::empty())
            .unwrap();
        let got = extract_query(req).await.expect("query decodes");
        assert_eq!(&got[..], &sample_wire()[..]);
    }

    #[tokio::test]
    async fn post_request_requires_dns_message_content_type() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .header(CONTENT_TYPE, "text/plain")
            .body(Body::from(sample_wire()))
            .unwrap();
        let resp = extract_query(req).await.expect_err("wrong content-type rejected");
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn post_request_with_dns_message_body_round_trips() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/dns-query")
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .body(Body::from(sample_wire()))
            .unwrap();
        let got = extract_query(req).await.expect("body decodes");
        assert_eq!(&got[..], &sample_wire()[..]);
    }

    #[tokio::test]
    async fn oversized_get_query_is_rejected() {
        let big = vec![0u8; MAX_BODY_BYTES + 1];
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(big);
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/dns-query?dns={encoded}"))
            .body(Body::empty())
            .unwrap();
        let resp = extract_query(req).await.expect_err("oversized body rejected");
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/dns-query")
            .body(Body::empty())
            .unwrap();
        let resp = extract_query(req).await.expect_err("PUT rejected");
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
