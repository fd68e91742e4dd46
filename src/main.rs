use chicha_http_proxy::config::Config;
use chicha_http_proxy::listener::{self, ListenerConfig};
use chicha_http_proxy::logging::{self, parse_log_format, parse_log_level};
use chicha_http_proxy::reverse_proxy::Forwarder;
use clap::Parser;
use log::{error, info, warn};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Transparent reverse proxy that ignores upstream TLS errors so chained certificates never block traffic",
    after_help = "Minimal:  chicha-http-proxy --target-url https://internal.service\n\
                  Extended: chicha-http-proxy --target-url https://internal.service --http-port 8080 --https-port 8443 --tls-cert server.crt --tls-key server.key"
)]
struct Args {
    #[clap(long, value_name = "PORT", help = "Port that accepts inbound HTTP traffic [default: 80]")]
    http_port: Option<String>,

    #[clap(long, value_name = "PORT", help = "Port for HTTPS when certificates are supplied [default: 443]")]
    https_port: Option<String>,

    #[clap(long, value_name = "URL", help = "Destination URL that will receive forwarded requests")]
    target_url: Option<String>,

    #[clap(long, value_name = "FILE", help = "Path to a PEM encoded certificate for the HTTPS listener")]
    tls_cert: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Path to a PEM encoded private key for the HTTPS listener")]
    tls_key: Option<PathBuf>,

    #[clap(long, value_name = "IP", help = "Address both listeners bind to [default: 0.0.0.0]")]
    bind_address: Option<IpAddr>,

    #[clap(long, value_name = "SECONDS", help = "Upstream request timeout in seconds [default: 60]")]
    timeout: Option<u64>,

    #[clap(long, help = "Follow upstream redirects inside the proxy instead of relaying them")]
    follow_redirects: bool,

    #[clap(long, value_name = "NUM", help = "Maximum redirects followed per request [default: 10]")]
    max_redirects: Option<usize>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;

    logging::init(&config.logging);

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let forwarder = match Forwarder::from_config(&config) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(e) => {
            error!("failed to create forwarder: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Forwarding requests to {} while ignoring target TLS validation errors",
        forwarder.target_url()
    );
    if config.follow_redirects {
        warn!(
            "Following upstream redirects (max {}); request bodies are buffered up to {} bytes",
            config.max_redirects, config.max_buffered_body_bytes
        );
    }

    let mut listeners = listener::start(ListenerConfig::from_config(&config), forwarder);
    let mut stopping = false;

    loop {
        tokio::select! {
            _ = signal::ctrl_c(), if !stopping => {
                info!("Received Ctrl+C, stopping listeners");
                listeners.shutdown();
                stopping = true;
            }
            event = listeners.next_event() => match event {
                Some(event) if event.is_error() => {
                    error!("proxy stopped: {}", event);
                    std::process::exit(1);
                }
                Some(event) => info!("{}", event),
                None => break,
            },
        }
    }

    info!("Proxy stopped");
    Ok(())
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = &args.http_port {
        config.http_port = port.clone();
    }
    if let Some(port) = &args.https_port {
        config.https_port = port.clone();
    }
    if let Some(target) = &args.target_url {
        config.target_url = target.clone();
    }
    if let Some(cert) = &args.tls_cert {
        config.tls_cert = Some(cert.clone());
    }
    if let Some(key) = &args.tls_key {
        config.tls_key = Some(key.clone());
    }
    if let Some(addr) = args.bind_address {
        config.bind_address = addr;
    }
    if let Some(timeout) = args.timeout {
        config.upstream_timeout_secs = timeout;
    }
    if args.follow_redirects {
        config.follow_redirects = true;
    }
    if let Some(max) = args.max_redirects {
        config.max_redirects = max;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = parse_log_level(level)?;
    }
    if let Some(format) = &args.log_format {
        config.logging.format = parse_log_format(format)?;
    }
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sample = Config {
        http_port: "8080".to_string(),
        https_port: "8443".to_string(),
        target_url: "https://internal.service".to_string(),
        tls_cert: Some(PathBuf::from("server.crt")),
        tls_key: Some(PathBuf::from("server.key")),
        ..Config::default()
    };
    sample.to_file(file_path)
}
