//! Server binding configuration.

use std::path::PathBuf;
use std::time::Duration;

use koatty_core::KoattyProtocol;

/// Settings for one server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Transport this binding serves.
    pub protocol: KoattyProtocol,
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Certificate material; required for `https` and `wss`.
    pub tls: Option<TlsConfig>,
    /// Websocket connection settings.
    pub connection: ConnectionConfig,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Transport-level ceiling on request processing time.
    pub request_timeout: Duration,
    /// Largest request body that is buffered into the context.
    pub body_limit: usize,
    /// How long `stop` waits for in-flight requests.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: KoattyProtocol::Http,
            host: "127.0.0.1".to_string(),
            port: 3000,
            tls: None,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            body_limit: 2 * 1024 * 1024,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Default settings for `protocol` on `host:port`.
    #[must_use]
    pub fn new(protocol: KoattyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

/// PEM certificate and key.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Per-connection websocket settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded outbound queue per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time a reply waits for queue space.
    pub send_timeout: Duration,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_message_size: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.protocol, KoattyProtocol::Http);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert!(config.tls.is_none());
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.body_limit, 2 * 1024 * 1024);
    }

    #[test]
    fn new_overrides_address_and_protocol() {
        let config = ServerConfig::new(KoattyProtocol::Ws, "0.0.0.0", 0);
        assert_eq!(config.protocol, KoattyProtocol::Ws);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.outbound_channel_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }
}
