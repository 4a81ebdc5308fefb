//! Data models

pub mod message;
pub mod proxy;

pub use message::{AckReply, AuthResult, Inbound, Ping};
pub use proxy::{load_roster, parse_roster, ProxyEndpoint, ProxyProtocol};
