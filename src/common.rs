use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by outbound requests and client responses.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Appends every value of every header in `from` onto `to`.
///
/// Repeated keys such as `Set-Cookie` keep all their values, in order.
pub fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        to.append(name.clone(), value.clone());
    }
}

/// Plain-text responses the proxy produces on its own behalf.
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Maps a per-request failure to its client status and a short body.
    pub fn from_error(err: &ProxyError) -> Response<ProxyBody> {
        Self::error(err.status_code(), err.public_message())
    }
}

/// Server-side TLS material for the HTTPS listener.
pub struct TlsConfig;

impl TlsConfig {
    /// Loads a PEM certificate chain and private key into a rustls server config.
    pub fn create_config(cert_path: &Path, private_key_path: &Path) -> Result<ServerConfig, ProxyError> {
        let mut cert_file = BufReader::new(File::open(cert_path).map_err(|e| {
            ProxyError::Config(format!("Failed to open certificate file {}: {}", cert_path.display(), e))
        })?);

        let mut private_key_file = BufReader::new(File::open(private_key_path).map_err(|e| {
            ProxyError::Config(format!(
                "Failed to open private key file {}: {}",
                private_key_path.display(),
                e
            ))
        })?);

        let certs = rustls_pemfile::certs(&mut cert_file)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(ProxyError::Config(format!(
                "No valid certificate found in {}",
                cert_path.display()
            )));
        }

        let private_key = rustls_pemfile::private_key(&mut private_key_file)
            .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| {
                ProxyError::Config(format!("No valid private key found in {}", private_key_path.display()))
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}
