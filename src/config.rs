use crate::error::ProxyError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_MAX_BUFFERED_BODY_BYTES: usize = 10 * 1024 * 1024;

fn default_http_port() -> String {
    "80".to_string()
}

fn default_https_port() -> String {
    "443".to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_upstream_timeout_secs() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

fn default_max_redirects() -> usize {
    DEFAULT_MAX_REDIRECTS
}

fn default_max_buffered_body_bytes() -> usize {
    DEFAULT_MAX_BUFFERED_BODY_BYTES
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

/// Process-wide settings. Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: String,
    #[serde(default = "default_https_port")]
    pub https_port: String,
    /// Upstream origin every request is forwarded to.
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    // Legacy behaviour, off by default: the proxy chases 3xx itself
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Upper bound on the inbound body kept in memory for redirect replay.
    #[serde(default = "default_max_buffered_body_bytes")]
    pub max_buffered_body_bytes: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            target_url: String::new(),
            tls_cert: None,
            tls_key: None,
            bind_address: default_bind_address(),
            upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_buffered_body_bytes: DEFAULT_MAX_BUFFERED_BODY_BYTES,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// HTTPS runs only when both the certificate and the key are configured.
    pub fn https_enabled(&self) -> bool {
        tls_pair(self.tls_cert.as_deref(), self.tls_key.as_deref()).is_some()
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.target_url.trim().is_empty() {
            return Err(ProxyError::Config(
                "target-url must be set so the proxy knows where to send traffic".to_string(),
            ));
        }
        parse_target_url(&self.target_url)?;

        parse_port(&self.http_port)?;
        if self.https_enabled() {
            parse_port(&self.https_port)?;
        } else if is_set(self.tls_cert.as_deref()) != is_set(self.tls_key.as_deref()) {
            warn!("Only one of tls-cert and tls-key is set; HTTPS stays disabled");
        }

        if self.upstream_timeout_secs == 0 {
            return Err(ProxyError::Config("upstream timeout must be at least 1 second".to_string()));
        }
        if self.follow_redirects && self.max_redirects == 0 {
            return Err(ProxyError::Config(
                "max-redirects must be at least 1 when following redirects".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_set(path: Option<&Path>) -> bool {
    path.map(|p| !p.as_os_str().is_empty()).unwrap_or(false)
}

/// Certificate and key, when both are present and non-empty.
pub fn tls_pair<'a>(cert: Option<&'a Path>, key: Option<&'a Path>) -> Option<(&'a Path, &'a Path)> {
    match (cert, key) {
        (Some(cert), Some(key)) if is_set(Some(cert)) && is_set(Some(key)) => Some((cert, key)),
        _ => None,
    }
}

/// Parses the upstream origin, accepting only absolute http(s) URLs with a host.
pub fn parse_target_url(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ProxyError::Config(format!("failed to parse target-url '{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProxyError::Config(format!(
                "target-url scheme must be http or https, got '{}'",
                other
            )));
        }
    }

    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ProxyError::Config(format!("target-url '{}' has no host", raw)));
    }

    Ok(url)
}

pub fn parse_port(raw: &str) -> Result<u16, ProxyError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|e| ProxyError::Config(format!("invalid port '{}': {}", raw, e)))
}
