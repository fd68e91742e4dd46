use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Inbound request could not be turned into an outbound one.
    #[error("Client request error: {0}")]
    ClientRequest(String),

    /// Inbound body exceeded the replay buffer used for redirect following.
    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    /// DNS, connect, TLS handshake or timeout against the upstream.
    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Streaming error: {0}")]
    Streaming(String),

    /// Listener socket failed to bind or crashed; ends that listener.
    #[error("Listener error: {0}")]
    ListenerFatal(String),
}

impl ProxyError {
    /// Status sent to the client when this error ends a single request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamTransport(_) | ProxyError::TooManyRedirects(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing message; details stay in the operator log.
    pub fn public_message(&self) -> &'static str {
        match self {
            ProxyError::UpstreamTransport(_) => "error forwarding request",
            ProxyError::TooManyRedirects(_) => "too many redirects",
            ProxyError::BodyTooLarge(_) => "request body too large",
            ProxyError::ClientRequest(_) => "failed to create upstream request",
            _ => "internal proxy error",
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, ProxyError::Config(_))
    }
}
