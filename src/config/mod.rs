/// Configuration management for framegate

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::codec::{DEFAULT_MAX_FRAME_SIZE, ROUTING_KEY_LEN};
use crate::core::listener::{ListenerSettings, DEFAULT_DRAIN_TIMEOUT};
use crate::core::pool::{PoolSettings, DEFAULT_MAX_CONNECTIONS};
use crate::core::ring::DEFAULT_REPLICAS;
use crate::core::{Backend, BackendRing, FrameCodec, SessionSettings};

pub use crate::error::ConfigError;

/// Main framegate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listening sockets
    pub server: ServerConfig,
    /// Backends, pooling and framing
    pub proxy: ProxyConfig,
    /// Deadlines for blocking operations
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Client-facing port
    pub service_port: u16,
    /// Interface to bind
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Port of the plain-text stats endpoint; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    /// Seconds granted to sessions after shutdown is requested
    #[serde(default = "default_drain_timeout_sec")]
    pub drain_timeout_sec: u64,
}

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Backend addresses as host:port
    pub backends: Vec<String>,
    /// Maximum pooled connections per backend
    #[serde(default = "default_server_connection")]
    pub server_connection: usize,
    /// Maximum frame body size in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Virtual nodes per backend on the hash ring
    #[serde(default = "default_ring_replicas")]
    pub ring_replicas: usize,
    /// TCP keepalive idle time for backend sockets, 0 = off
    #[serde(default)]
    pub tcp_keepalive_sec: u64,
}

/// Timeouts; 0 disables a deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Establishing a backend connection
    #[serde(default = "default_dial_ms")]
    pub dial_ms: u64,
    /// Waiting for a saturated pool
    #[serde(default)]
    pub acquire_ms: u64,
    /// Forwarding a request and reading its response
    #[serde(default)]
    pub backend_io_ms: u64,
    /// Waiting for the next client request or writing a response
    #[serde(default)]
    pub client_idle_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log one in every n accepted connections, 0 = all
    #[serde(default)]
    pub log_access_every: u64,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_drain_timeout_sec() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_secs()
}

fn default_server_connection() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_ring_replicas() -> usize {
    DEFAULT_REPLICAS
}

fn default_dial_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_ms: default_dial_ms(),
            acquire_ms: 0,
            backend_io_ms: 0,
            client_idle_sec: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_access_every: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                service_port: 9090,
                bind_host: default_bind_host(),
                debug_port: None,
                drain_timeout_sec: default_drain_timeout_sec(),
            },
            proxy: ProxyConfig {
                backends: vec!["127.0.0.1:9091".to_string()],
                server_connection: default_server_connection(),
                max_frame_size: default_max_frame_size(),
                ring_replicas: default_ring_replicas(),
                tcp_keepalive_sec: 0,
            },
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Apply command line overrides and validate the result
    pub fn apply_overrides(
        &mut self,
        service_port: Option<u16>,
        backends: Option<Vec<String>>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = service_port {
            self.server.service_port = port;
        }
        if let Some(backends) = backends {
            self.proxy.backends = backends;
        }
        self.validate()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server config
        if self.server.service_port == 0 {
            return Err(ConfigError::ValidationError(
                "service_port must be greater than 0".to_string(),
            ));
        }

        if self.server.bind_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "bind_host cannot be empty".to_string(),
            ));
        }

        if let Some(debug_port) = self.server.debug_port {
            if debug_port == 0 || debug_port == self.server.service_port {
                return Err(ConfigError::ValidationError(format!(
                    "debug_port {} must be non-zero and differ from service_port",
                    debug_port
                )));
            }
        }

        // Validate proxy config
        if self.proxy.backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "backends cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.proxy.backends {
            validate_backend_addr(backend)?;
            if !seen.insert(backend.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate backend: {}",
                    backend
                )));
            }
        }

        if self.proxy.server_connection == 0 {
            return Err(ConfigError::ValidationError(
                "server_connection must be greater than 0".to_string(),
            ));
        }

        if self.proxy.max_frame_size <= ROUTING_KEY_LEN {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be greater than {}",
                ROUTING_KEY_LEN
            )));
        }

        if self.proxy.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::ValidationError(
                "max_frame_size must fit in a 32-bit length prefix".to_string(),
            ));
        }

        if self.proxy.ring_replicas == 0 {
            return Err(ConfigError::ValidationError(
                "ring_replicas must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            server: ServerConfig {
                debug_port: Some(9190),
                ..Config::default().server
            },
            proxy: ProxyConfig {
                backends: vec![
                    "10.0.1.10:9090".to_string(),
                    "10.0.1.11:9090".to_string(),
                    "10.0.1.12:9090".to_string(),
                ],
                ..Config::default().proxy
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }

    /// Client-facing bind address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.service_port)
    }

    /// Stats endpoint bind address, if enabled
    pub fn debug_addr(&self) -> Option<String> {
        self.server
            .debug_port
            .map(|port| format!("{}:{}", self.server.bind_host, port))
    }

    /// Hash ring over the configured backends
    pub fn ring(&self) -> BackendRing {
        BackendRing::with_replicas(
            self.proxy.backends.iter().map(|addr| Backend::new(addr.as_str())),
            self.proxy.ring_replicas,
        )
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        seconds(self.proxy.tcp_keepalive_sec)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.proxy.server_connection,
            dial_timeout: millis(self.timeouts.dial_ms),
            acquire_timeout: millis(self.timeouts.acquire_ms),
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            session: SessionSettings {
                codec: FrameCodec::new(self.proxy.max_frame_size),
                client_idle_timeout: seconds(self.timeouts.client_idle_sec),
                backend_io_timeout: millis(self.timeouts.backend_io_ms),
            },
            log_access_every: self.logging.log_access_every,
            drain_timeout: Duration::from_secs(self.server.drain_timeout_sec),
        }
    }
}

fn validate_backend_addr(addr: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::ValidationError(format!("Invalid backend address: {}", addr));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.trim().is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid()),
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
