//! HTTP and HTTPS listeners sharing one [`Forwarder`], plus the aggregator that
//! merges their termination into a single stream.
//!
//! Each listener runs as its own task and ends exactly once, either because it
//! was shut down through its [`ListenerHandle`] or because of a fatal error.
//! The aggregator forwards one [`TerminationEvent`] per listener and closes the
//! stream after the last one.

use crate::common::TlsConfig;
use crate::config::{parse_port, tls_pair, Config};
use crate::error::ProxyError;
use crate::reverse_proxy::Forwarder;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, info, warn};
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Http,
    Https,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => write!(f, "http"),
            ListenerKind::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    pub http_port: String,
    pub https_port: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl ListenerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_address: config.bind_address,
            http_port: config.http_port.clone(),
            https_port: config.https_port.clone(),
            cert_path: config.tls_cert.clone(),
            key_path: config.tls_key.clone(),
        }
    }

    fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        tls_pair(self.cert_path.as_deref(), self.key_path.as_deref())
            .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()))
    }

    pub fn https_enabled(&self) -> bool {
        self.tls_paths().is_some()
    }
}

/// One listener has stopped. `result` is `Ok` for an explicit shutdown.
#[derive(Debug)]
pub struct TerminationEvent {
    pub listener: ListenerKind,
    pub result: Result<(), ProxyError>,
}

impl TerminationEvent {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    pub fn error(&self) -> Option<&ProxyError> {
        self.result.as_ref().err()
    }
}

impl fmt::Display for TerminationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(()) => write!(f, "{} listener stopped", self.listener),
            Err(e) => write!(f, "{} listener stopped: {}", self.listener, e),
        }
    }
}

/// Control side of a running listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    kind: ListenerKind,
    shutdown: CancellationToken,
    bound: watch::Receiver<Option<SocketAddr>>,
}

impl ListenerHandle {
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Waits until the socket is bound. `None` if the listener stopped first.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.clone();
        match bound.wait_for(|addr| addr.is_some()).await {
            Ok(addr) => *addr,
            Err(_) => None,
        }
    }

    /// Stops accepting connections; the listener then reports a clean stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct RunningListeners {
    events: mpsc::Receiver<TerminationEvent>,
    http: ListenerHandle,
    https: Option<ListenerHandle>,
}

impl RunningListeners {
    /// Next termination event, or `None` once every listener has reported.
    pub async fn next_event(&mut self) -> Option<TerminationEvent> {
        self.events.recv().await
    }

    pub fn http(&self) -> &ListenerHandle {
        &self.http
    }

    pub fn https(&self) -> Option<&ListenerHandle> {
        self.https.as_ref()
    }

    pub fn listener_count(&self) -> usize {
        1 + usize::from(self.https.is_some())
    }

    pub fn shutdown(&self) {
        self.http.shutdown();
        if let Some(https) = &self.https {
            https.shutdown();
        }
    }
}

type ListenerTask = (ListenerKind, JoinHandle<Result<(), ProxyError>>);

/// Spawns the HTTP listener, the HTTPS listener when TLS material is
/// configured, and the aggregator. Must be called inside a tokio runtime.
pub fn start(config: ListenerConfig, forwarder: Arc<Forwarder>) -> RunningListeners {
    let mut tasks: Vec<ListenerTask> = Vec::with_capacity(2);

    let http = spawn_listener(
        ListenerKind::Http,
        config.bind_address,
        config.http_port.clone(),
        None,
        forwarder.clone(),
        &mut tasks,
    );

    let https = match config.tls_paths() {
        Some(paths) => Some(spawn_listener(
            ListenerKind::Https,
            config.bind_address,
            config.https_port.clone(),
            Some(paths),
            forwarder,
            &mut tasks,
        )),
        None => {
            info!("No TLS certificate configured, running HTTP on port {} only", config.http_port);
            None
        }
    };

    let (events_tx, events_rx) = mpsc::channel(tasks.len());
    tokio::spawn(aggregate(tasks, events_tx));

    RunningListeners {
        events: events_rx,
        http,
        https,
    }
}

fn spawn_listener(
    kind: ListenerKind,
    bind_address: IpAddr,
    port: String,
    tls_paths: Option<(PathBuf, PathBuf)>,
    forwarder: Arc<Forwarder>,
    tasks: &mut Vec<ListenerTask>,
) -> ListenerHandle {
    let shutdown = CancellationToken::new();
    let (bound_tx, bound_rx) = watch::channel(None);

    let task = tokio::spawn(run_listener(
        kind,
        bind_address,
        port,
        tls_paths,
        forwarder,
        shutdown.clone(),
        bound_tx,
    ));
    tasks.push((kind, task));

    ListenerHandle {
        kind,
        shutdown,
        bound: bound_rx,
    }
}

/// Emits exactly one event per listener, then drops the only sender so the
/// stream closes.
async fn aggregate(tasks: Vec<ListenerTask>, events: mpsc::Sender<TerminationEvent>) {
    let mut remaining = tasks.len();
    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|(kind, task)| async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::ListenerFatal(format!("listener task aborted: {}", e))),
            };
            TerminationEvent { listener: kind, result }
        })
        .collect();

    while let Some(event) = pending.next().await {
        remaining -= 1;
        debug!("{} ({} listener(s) still running)", event, remaining);
        if events.send(event).await.is_err() {
            debug!("termination stream receiver dropped");
        }
    }
}

async fn run_listener(
    kind: ListenerKind,
    bind_address: IpAddr,
    port: String,
    tls_paths: Option<(PathBuf, PathBuf)>,
    forwarder: Arc<Forwarder>,
    shutdown: CancellationToken,
    bound: watch::Sender<Option<SocketAddr>>,
) -> Result<(), ProxyError> {
    let acceptor = match tls_paths {
        Some((cert_path, key_path)) => {
            debug!("Loading TLS certificate from: {}", cert_path.display());
            debug!("Loading TLS private key from: {}", key_path.display());
            let tls_config = TlsConfig::create_config(&cert_path, &key_path)?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => None,
    };

    let addr = SocketAddr::new(bind_address, parse_port(&port)?);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::ListenerFatal(format!("failed to bind {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ProxyError::ListenerFatal(format!("failed to read bound address: {}", e)))?;

    bound.send_replace(Some(local_addr));
    info!("{} listening on {}", kind.to_string().to_uppercase(), local_addr);

    let mut backoff = AcceptBackoff::default();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => None,
            accepted = listener.accept() => Some(accepted),
        };

        let Some(accepted) = accepted else {
            info!("{} listener on {} shutting down", kind, local_addr);
            return Ok(());
        };

        let (stream, remote_addr) = match accepted {
            Ok(conn) => {
                backoff.reset();
                conn
            }
            Err(e) if is_listener_broken(&e) => {
                return Err(ProxyError::ListenerFatal(format!("accept failed on {}: {}", local_addr, e)));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("{} accept error on {}: {}; retrying in {:?}", kind, local_addr, e, delay);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("{} listener on {} shutting down", kind, local_addr);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        let forwarder = forwarder.clone();
        match &acceptor {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(tls_stream, remote_addr, forwarder, kind).await,
                        Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(stream, remote_addr, forwarder, kind));
            }
        }
    }
}

// EINVAL from accept means the socket is no longer listening. Anything else
// (aborted handshakes, EMFILE, ENOBUFS...) passes once load drops.
fn is_listener_broken(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidInput
}

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between retries after a failed accept: doubles up to one second.
#[derive(Debug, Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => ACCEPT_BACKOFF_START,
            Some(previous) => (previous * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

async fn serve_connection<S>(stream: S, remote_addr: SocketAddr, forwarder: Arc<Forwarder>, kind: ListenerKind)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let forwarder = forwarder.clone();
        async move { Ok::<_, Infallible>(forwarder.handle(req).await) }
    });

    if let Err(e) = ServerBuilder::new()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        warn!("Error serving {} connection from {}: {}", kind, remote_addr, e);
    }
}
