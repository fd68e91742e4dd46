use crate::common::{copy_headers, full_body, BoxError, ProxyBody, ResponseBuilder};
use crate::config::{parse_target_url, Config, DEFAULT_MAX_BUFFERED_BODY_BYTES, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION};
use hyper::{Method, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant, Sleep};
use url::Url;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// How 3xx answers from the upstream are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForwardPolicy {
    /// Relay every upstream response, redirects included, to the client untouched.
    #[default]
    PassThrough,
    /// Chase redirects inside the proxy, giving up after `max_hops`.
    FollowRedirects { max_hops: usize },
}

/// Builds the upstream connector. Certificate chain and hostname checks are
/// always disabled: the upstream is trusted regardless of what it presents.
pub fn insecure_https_connector() -> Result<HttpsConnector<HttpConnector>, ProxyError> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to build upstream TLS connector: {}", e)))?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);

    Ok(HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls))))
}

/// Forwards every inbound request to one fixed upstream origin.
///
/// Holds no per-request state; share it behind an `Arc` across listeners.
pub struct Forwarder {
    client: UpstreamClient,
    target_url: Url,
    // scheme://authority plus the target's base path, without a trailing slash
    origin_prefix: String,
    timeout_duration: Duration,
    policy: ForwardPolicy,
    max_buffered_body: usize,
}

impl Forwarder {
    pub fn new(target_url: &str) -> Result<Self, ProxyError> {
        let url = parse_target_url(target_url)?;
        let origin_prefix = origin_prefix(&url)?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(insecure_https_connector()?);

        Ok(Self {
            client,
            target_url: url,
            origin_prefix,
            timeout_duration: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            policy: ForwardPolicy::PassThrough,
            max_buffered_body: DEFAULT_MAX_BUFFERED_BODY_BYTES,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let policy = if config.follow_redirects {
            ForwardPolicy::FollowRedirects {
                max_hops: config.max_redirects,
            }
        } else {
            ForwardPolicy::PassThrough
        };

        Ok(Self::new(&config.target_url)?
            .with_timeout(Duration::from_secs(config.upstream_timeout_secs))
            .with_policy(policy)
            .with_max_buffered_body(config.max_buffered_body_bytes))
    }

    pub fn with_timeout(mut self, timeout_duration: Duration) -> Self {
        self.timeout_duration = timeout_duration;
        self
    }

    pub fn with_policy(mut self, policy: ForwardPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_buffered_body(mut self, max_bytes: usize) -> Self {
        self.max_buffered_body = max_bytes;
        self
    }

    pub fn target_url(&self) -> &Url {
        &self.target_url
    }

    pub fn policy(&self) -> ForwardPolicy {
        self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_duration
    }

    /// Serves one inbound request. Never fails: errors become 5xx/413 responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.process_request(req).await {
            Ok(response) => {
                debug!("{} {} -> {}", method, path, response.status());
                response
            }
            Err(e) => {
                warn!("proxy error forwarding {} {}: {}", method, path, e);
                ResponseBuilder::from_error(&e)
            }
        }
    }

    async fn process_request<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        // One budget for the whole exchange: every hop, the head and both bodies
        let deadline = Instant::now() + self.timeout_duration;
        let (parts, body) = req.into_parts();
        let target_uri = self.build_target_uri(&parts.uri)?;

        match self.policy {
            ForwardPolicy::PassThrough => {
                let body = DeadlineBody::wrap(
                    body.map_err(Into::into).boxed_unsync(),
                    deadline,
                    format!("request body for {}", target_uri),
                );
                let outbound = build_outbound_request(&parts.method, &target_uri, &parts.headers, body)?;
                let response = self.send(outbound, &target_uri, deadline).await?;
                Ok(relay_response(response, &target_uri, deadline))
            }
            ForwardPolicy::FollowRedirects { max_hops } => {
                let buffered = self.buffer_body(body, deadline).await?;
                self.forward_following_redirects(
                    &parts.method,
                    &parts.headers,
                    target_uri,
                    buffered,
                    max_hops,
                    deadline,
                )
                .await
            }
        }
    }

    async fn forward_following_redirects(
        &self,
        method: &Method,
        headers: &HeaderMap,
        target_uri: Uri,
        body: Bytes,
        max_hops: usize,
        deadline: Instant,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let mut current = target_uri;
        let mut hops = 0;

        loop {
            let outbound = build_outbound_request(method, &current, headers, full_body(body.clone()))?;
            let response = self.send(outbound, &current, deadline).await?;

            if !response.status().is_redirection() {
                return Ok(relay_response(response, &current, deadline));
            }
            // 304 and friends carry no Location; nothing to chase
            let Some(location) = response.headers().get(LOCATION) else {
                return Ok(relay_response(response, &current, deadline));
            };

            if hops >= max_hops {
                return Err(ProxyError::TooManyRedirects(max_hops));
            }

            let next = resolve_location(&current, location)?;
            info!("Following redirect ({}) from {} to {}", response.status(), current, next);
            hops += 1;
            current = next;
        }
    }

    async fn buffer_body<B>(&self, body: B, deadline: Instant) -> Result<Bytes, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let collected = timeout_at(deadline, Limited::new(body, self.max_buffered_body).collect())
            .await
            .map_err(|_| {
                ProxyError::ClientRequest(format!(
                    "request body not received within {:?}",
                    self.timeout_duration
                ))
            })?;

        match collected {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ProxyError::BodyTooLarge(self.max_buffered_body))
            }
            Err(e) => Err(ProxyError::ClientRequest(format!("failed to read request body: {}", e))),
        }
    }

    async fn send(
        &self,
        req: Request<ProxyBody>,
        target_uri: &Uri,
        deadline: Instant,
    ) -> Result<Response<Incoming>, ProxyError> {
        match timeout_at(deadline, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::UpstreamTransport(format!(
                "forwarding to {}: {}",
                target_uri,
                error_chain(&e)
            ))),
            Err(_) => Err(ProxyError::UpstreamTransport(format!(
                "no response from {} within {:?}",
                target_uri, self.timeout_duration
            ))),
        }
    }

    /// Maps the inbound path and query onto the target origin.
    ///
    /// The origin supplies scheme, authority and base path; the inbound path is
    /// appended and the inbound query is carried over byte for byte.
    pub fn build_target_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let mut target = String::with_capacity(self.origin_prefix.len() + 64);
        target.push_str(&self.origin_prefix);
        target.push_str(inbound.path());
        if let Some(query) = inbound.query() {
            target.push('?');
            target.push_str(query);
        }

        target
            .parse::<Uri>()
            .map_err(|e| ProxyError::ClientRequest(format!("invalid target URI '{}': {}", target, e)))
    }
}

fn origin_prefix(url: &Url) -> Result<String, ProxyError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Config(format!("target-url '{}' has no host", url)))?;

    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    Ok(format!(
        "{}://{}{}",
        url.scheme(),
        authority,
        url.path().trim_end_matches('/')
    ))
}

/// Copies method and headers (by value) and points `Host` at the outbound authority.
fn build_outbound_request(
    method: &Method,
    target_uri: &Uri,
    headers: &HeaderMap,
    body: ProxyBody,
) -> Result<Request<ProxyBody>, ProxyError> {
    let authority = target_uri
        .authority()
        .ok_or_else(|| ProxyError::ClientRequest(format!("target URI '{}' has no authority", target_uri)))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|e| ProxyError::ClientRequest(format!("invalid host '{}': {}", authority, e)))?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = method.clone();
    *outbound.uri_mut() = target_uri.clone();
    copy_headers(headers, outbound.headers_mut());
    outbound.headers_mut().insert(HOST, host);

    Ok(outbound)
}

/// Status, every header value and the streamed body go back unchanged.
fn relay_response(upstream: Response<Incoming>, target_uri: &Uri, deadline: Instant) -> Response<ProxyBody> {
    let (parts, body) = upstream.into_parts();
    let source = target_uri.to_string();

    // Headers are already on the wire when the body fails, so only log it
    let body = body
        .map_err(move |e| {
            let err = ProxyError::Streaming(format!("copying response body from {}: {}", source, e));
            warn!("proxy error {}", err);
            BoxError::from(e)
        })
        .boxed_unsync();
    let body = DeadlineBody::wrap(body, deadline, format!("response body from {}", target_uri));

    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    copy_headers(&parts.headers, response.headers_mut());
    response
}

/// Body that fails with a `Streaming` error once the request deadline passes.
struct DeadlineBody {
    inner: ProxyBody,
    deadline: Pin<Box<Sleep>>,
    label: String,
    expired: bool,
}

impl DeadlineBody {
    fn wrap(inner: ProxyBody, deadline: Instant, label: String) -> ProxyBody {
        DeadlineBody {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            label,
            expired: false,
        }
        .boxed_unsync()
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if self.expired {
            return Poll::Ready(None);
        }

        // Checked first so a slow trickle cannot outlive the deadline either
        if self.deadline.as_mut().poll(cx).is_ready() {
            self.expired = true;
            let err = ProxyError::Streaming(format!("{} still streaming at the deadline", self.label));
            warn!("proxy error {}", err);
            return Poll::Ready(Some(Err(err.into())));
        }

        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn resolve_location(current: &Uri, location: &HeaderValue) -> Result<Uri, ProxyError> {
    let location = location
        .to_str()
        .map_err(|e| ProxyError::UpstreamTransport(format!("redirect location is not valid text: {}", e)))?;

    let base = Url::parse(&current.to_string())?;
    let next = base
        .join(location)
        .map_err(|e| ProxyError::UpstreamTransport(format!("invalid redirect location '{}': {}", location, e)))?;

    next.as_str()
        .parse::<Uri>()
        .map_err(|e| ProxyError::UpstreamTransport(format!("invalid redirect location '{}': {}", next, e)))
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(target: &str) -> Forwarder {
        Forwarder::new(target).unwrap()
    }

    #[test]
    fn test_target_uri_building() {
        let proxy = forwarder("http://backend.example.com");
        let target = proxy.build_target_uri(&"/api/users".parse().unwrap()).unwrap();
        assert_eq!(target.to_string(), "http://backend.example.com/api/users");
    }

    #[test]
    fn test_target_uri_keeps_base_path_and_port() {
        let proxy = forwarder("https://backend.example.com:8443/base/");
        let target = proxy.build_target_uri(&"/api/users?id=7&sort=desc".parse().unwrap()).unwrap();
        assert_eq!(target.to_string(), "https://backend.example.com:8443/base/api/users?id=7&sort=desc");
    }

    #[test]
    fn test_target_uri_preserves_query_verbatim() {
        let proxy = forwarder("http://backend.example.com/v1");
        let inbound: Uri = "/search?q=a%20b&tag=x&tag=y&empty=".parse().unwrap();
        let target = proxy.build_target_uri(&inbound).unwrap();
        assert_eq!(target.path(), "/v1/search");
        assert_eq!(target.query(), Some("q=a%20b&tag=x&tag=y&empty="));
    }

    #[test]
    fn test_target_uri_ignores_inbound_authority() {
        let proxy = forwarder("http://backend.example.com");
        let inbound: Uri = "http://attacker.example.org/path".parse().unwrap();
        let target = proxy.build_target_uri(&inbound).unwrap();
        assert_eq!(target.to_string(), "http://backend.example.com/path");
    }

    #[test]
    fn test_forwarder_creation() {
        assert!(Forwarder::new("http://backend.example.com").is_ok());
        assert!(matches!(Forwarder::new("not-a-url"), Err(ProxyError::Config(_))));
        assert!(matches!(Forwarder::new("mailto:ops@example.com"), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_from_config_applies_policy() {
        let config = Config {
            target_url: "http://backend:3000".to_string(),
            follow_redirects: true,
            max_redirects: 4,
            upstream_timeout_secs: 5,
            ..Config::default()
        };
        let proxy = Forwarder::from_config(&config).unwrap();
        assert_eq!(proxy.policy(), ForwardPolicy::FollowRedirects { max_hops: 4 });
        assert_eq!(proxy.timeout(), Duration::from_secs(5));

        let proxy = forwarder("http://backend:3000");
        assert_eq!(proxy.policy(), ForwardPolicy::PassThrough);
        assert_eq!(ForwardPolicy::default(), ForwardPolicy::PassThrough);
        assert_eq!(proxy.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_outbound_request_rewrites_host_only() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("proxy.local"));
        headers.append("x-multi", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("2"));

        let target: Uri = "https://backend.example.com:8443/x".parse().unwrap();
        let outbound = build_outbound_request(&Method::PUT, &target, &headers, full_body("hi")).unwrap();

        assert_eq!(outbound.method(), Method::PUT);
        assert_eq!(outbound.headers().get(HOST).unwrap(), "backend.example.com:8443");
        let multi: Vec<_> = outbound.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["1", "2"]);
        // the inbound map is untouched
        assert_eq!(headers.get(HOST).unwrap(), "proxy.local");
    }

    #[tokio::test]
    async fn test_deadline_body_cuts_off_a_stalled_stream() {
        let stalled = http_body_util::StreamBody::new(futures::stream::pending::<Result<Frame<Bytes>, BoxError>>());
        let body = DeadlineBody::wrap(
            stalled.boxed_unsync(),
            Instant::now() + Duration::from_millis(50),
            "response body from test".to_string(),
        );

        let result = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .expect("deadline should end the body");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("still streaming at the deadline"));
    }

    #[tokio::test]
    async fn test_deadline_body_passes_complete_bodies_through() {
        let body = DeadlineBody::wrap(
            full_body("complete"),
            Instant::now() + Duration::from_secs(5),
            "response body from test".to_string(),
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"complete");
    }

    #[test]
    fn test_resolve_location() {
        let current: Uri = "http://backend.example.com/a/b?x=1".parse().unwrap();
        let next = resolve_location(&current, &HeaderValue::from_static("/next")).unwrap();
        assert_eq!(next.to_string(), "http://backend.example.com/next");

        let next = resolve_location(&current, &HeaderValue::from_static("c")).unwrap();
        assert_eq!(next.to_string(), "http://backend.example.com/a/c");

        let next = resolve_location(&current, &HeaderValue::from_static("https://other.example.com/z")).unwrap();
        assert_eq!(next.to_string(), "https://other.example.com/z");
    }
}
