use thiserror::Error;

/// Unified error type for the wsfarm application
#[derive(Error, Debug)]
pub enum FarmError {
    // Proxy errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Upstream connection errors
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Keepalive send failed")]
    KeepaliveFailed,

    #[error("Connection closed by remote")]
    ConnectionClosed,

    // Wire format errors
    #[error("Message decode error: {0}")]
    Decode(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for wsfarm operations
pub type Result<T> = std::result::Result<T, FarmError>;

// Convert from URL parse errors
impl From<url::ParseError> for FarmError {
    fn from(err: url::ParseError) -> Self {
        FarmError::InvalidProxyAddress(err.to_string())
    }
}

// Convert from native-tls errors
impl From<native_tls::Error> for FarmError {
    fn from(err: native_tls::Error) -> Self {
        FarmError::Tls(err.to_string())
    }
}
