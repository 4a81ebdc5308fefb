use crate::error::{FarmError, Result};
use std::env;
use std::time::Duration;

/// Default upstream endpoint the pool connects to.
pub const DEFAULT_ENDPOINT: &str = "wss://proxy2.wynd.network:4444/";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Pool supervision configuration
    pub pool: PoolConfig,
    /// Per-connection worker configuration
    pub worker: WorkerConfig,
    /// Upstream endpoint configuration
    pub endpoint: EndpointConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path to the proxy roster file (one endpoint URL per line)
    pub proxy_file: String,
    /// Maximum number of concurrently running connection workers
    pub max_connections: usize,
    /// Interval between monitor ticks (status line + top-up)
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum consecutive connect attempts before giving up on a proxy
    pub max_retries: u32,
    /// Delay between consecutive connect attempts
    pub retry_delay: Duration,
    /// Interval between keepalive PINGs on a live connection
    pub ping_interval: Duration,
    /// Timeout for reading a single message
    pub read_timeout: Duration,
    /// Bounds of the jittered pre-connect delay
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(15),
            jitter_min: Duration::from_millis(500),
            jitter_max: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upstream WebSocket URL (wss://host:port/path)
    pub url: url::Url,
}

impl EndpointConfig {
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| FarmError::InvalidConfig(format!("invalid endpoint URL '{}': {}", url, e)))?;
        if url.host_str().is_none() {
            return Err(FarmError::InvalidConfig(format!(
                "endpoint URL '{}' is missing a host",
                url
            )));
        }
        Ok(Self { url })
    }

    /// Host to dial through the proxy
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port to dial through the proxy
    pub fn port(&self) -> u16 {
        self.url
            .port()
            .unwrap_or(match self.url.scheme() {
                "ws" => 80,
                _ => 443,
            })
    }

    /// Whether the endpoint uses TLS
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            pool: PoolConfig {
                proxy_file: get_env_or("PROXY_FILE", "proxy.txt"),
                max_connections: get_env_or("POOL_MAX_CONNECTIONS", "100")
                    .parse()
                    .map_err(|_| {
                        FarmError::InvalidConfig("POOL_MAX_CONNECTIONS must be a number".into())
                    })?,
                check_interval: Duration::from_secs(
                    get_env_or("POOL_CHECK_INTERVAL", "60").parse().unwrap_or(60),
                ),
            },
            worker: WorkerConfig {
                max_retries: get_env_or("WORKER_MAX_RETRIES", "5").parse().unwrap_or(5),
                retry_delay: Duration::from_secs(
                    get_env_or("WORKER_RETRY_DELAY", "10").parse().unwrap_or(10),
                ),
                ping_interval: Duration::from_secs(
                    get_env_or("WORKER_PING_INTERVAL", "30").parse().unwrap_or(30),
                ),
                read_timeout: Duration::from_secs(
                    get_env_or("WORKER_READ_TIMEOUT", "15").parse().unwrap_or(15),
                ),
                ..WorkerConfig::default()
            },
            endpoint: EndpointConfig::new(&get_env_or("WS_ENDPOINT", DEFAULT_ENDPOINT))?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
