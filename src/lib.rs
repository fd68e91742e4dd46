pub mod common;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod reverse_proxy;

pub use config::Config;
pub use error::ProxyError;
pub use listener::{ListenerConfig, ListenerHandle, ListenerKind, RunningListeners, TerminationEvent};
pub use reverse_proxy::{ForwardPolicy, Forwarder};
