//! Shared helpers: loopback upstream servers, clients and throwaway certificates.
#![allow(dead_code)]

use bytes::Bytes;
use chicha_http_proxy::listener::{self, ListenerConfig, RunningListeners};
use chicha_http_proxy::reverse_proxy::{insecure_https_connector, Forwarder};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// What an upstream saw for one request.
#[derive(Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Serves `handler` on a loopback port until the test runtime shuts down.
pub async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Upstream answering 200, `X-Echo: A`, `X-Echo: B`, body `payload`, and
/// reporting every request it received.
pub async fn spawn_echo_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = spawn_upstream(move |req: Request<Incoming>| {
        let tx = tx.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await.unwrap().to_bytes();
            let _ = tx.send(RecordedRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            });

            Response::builder()
                .status(StatusCode::OK)
                .header("X-Echo", "A")
                .header("X-Echo", "B")
                .body(Full::new(Bytes::from_static(b"payload")))
                .unwrap()
        }
    })
    .await;

    (addr, rx)
}

pub fn http_client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Client that trusts any certificate, for talking to the HTTPS listener.
pub fn insecure_client() -> Client<HttpsConnector<HttpConnector>, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(insecure_https_connector().unwrap())
}

pub fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub async fn read_body(response: Response<Incoming>) -> (StatusCode, HeaderMap, Bytes) {
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

pub fn loopback_config(http_port: &str) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        http_port: http_port.to_string(),
        https_port: "0".to_string(),
        cert_path: None,
        key_path: None,
    }
}

/// HTTP-only proxy on an ephemeral port in front of `target`.
pub async fn start_http_proxy(forwarder: Forwarder) -> (RunningListeners, SocketAddr) {
    let listeners = listener::start(loopback_config("0"), Arc::new(forwarder));
    let addr = listeners.http().local_addr().await.expect("http listener should bind");
    (listeners, addr)
}

/// Self-signed certificate and key for `localhost`, written to temp files.
pub struct TlsFiles {
    pub cert: NamedTempFile,
    pub key: NamedTempFile,
}

impl TlsFiles {
    pub fn self_signed() -> Self {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        let mut key = NamedTempFile::new().unwrap();
        cert.write_all(generated.cert.pem().as_bytes()).unwrap();
        key.write_all(generated.key_pair.serialize_pem().as_bytes()).unwrap();
        Self { cert, key }
    }

    pub fn garbage() -> Self {
        let mut cert = NamedTempFile::new().unwrap();
        let mut key = NamedTempFile::new().unwrap();
        writeln!(cert, "-----BEGIN CERTIFICATE-----\nnot base64 at all\n-----END CERTIFICATE-----").unwrap();
        writeln!(key, "definitely not a key").unwrap();
        Self { cert, key }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert.path().to_path_buf()
    }

    pub fn key_path(&self) -> PathBuf {
        self.key.path().to_path_buf()
    }
}

pub fn dual_config(tls: &TlsFiles) -> ListenerConfig {
    ListenerConfig {
        cert_path: Some(tls.cert_path()),
        key_path: Some(tls.key_path()),
        ..loopback_config("0")
    }
}
