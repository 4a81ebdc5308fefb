//! Wire envelopes exchanged with the upstream endpoint
//!
//! Field names and literal values must match the upstream protocol exactly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;

/// Envelope schema version carried on every outbound PING
pub const ENVELOPE_VERSION: &str = "1.0.0";
/// Emulated client version reported in the AUTH result
pub const CLIENT_VERSION: &str = "4.26.2";
/// Device type reported in the AUTH result
pub const DEVICE_TYPE: &str = "extension";
/// Emulated browser extension id
pub const EXTENSION_ID: &str = "lkbnfiajjmbhnfledhphioinpickokdi";

/// Outbound keepalive envelope
#[derive(Debug, Clone, Serialize)]
pub struct Ping {
    pub id: String,
    pub version: &'static str,
    pub action: &'static str,
    pub data: Value,
}

impl Ping {
    /// Fresh PING with a random id and empty data
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: ENVELOPE_VERSION,
            action: "PING",
            data: json!({}),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity payload carried in the AUTH reply
#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub browser_id: String,
    pub user_id: String,
    pub user_agent: String,
    pub timestamp: i64,
    pub device_type: &'static str,
    pub version: &'static str,
    pub extension_id: &'static str,
}

impl AuthResult {
    pub fn new(browser_id: String, user_id: String, user_agent: String) -> Self {
        Self {
            browser_id,
            user_id,
            user_agent,
            timestamp: chrono::Utc::now().timestamp(),
            device_type: DEVICE_TYPE,
            version: CLIENT_VERSION,
            extension_id: EXTENSION_ID,
        }
    }
}

/// Reply to a server-initiated envelope, echoing its id
#[derive(Debug, Clone, Serialize)]
pub struct AckReply {
    pub id: String,
    pub origin_action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AuthResult>,
}

impl AckReply {
    pub fn auth(id: String, result: AuthResult) -> Self {
        Self {
            id,
            origin_action: "AUTH",
            result: Some(result),
        }
    }

    pub fn pong(id: String) -> Self {
        Self {
            id,
            origin_action: "PONG",
            result: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// An inbound envelope, decoded once at the connection boundary.
///
/// Actions outside the known set land in `Unrecognized` so the caller can
/// make ignoring them an observable choice rather than a silent default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Auth { id: String },
    Pong { id: String },
    Error { message: String },
    Unrecognized { action: Option<String> },
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        match raw.action.as_deref() {
            Some("AUTH") => Ok(Inbound::Auth {
                id: raw.id.ok_or_else(|| missing_field("AUTH", "id"))?,
            }),
            Some("PONG") => Ok(Inbound::Pong {
                id: raw.id.ok_or_else(|| missing_field("PONG", "id"))?,
            }),
            Some("ERROR") => Ok(Inbound::Error {
                message: raw.message.unwrap_or_default(),
            }),
            other => Ok(Inbound::Unrecognized {
                action: other.map(|s| s.to_string()),
            }),
        }
    }
}

fn missing_field(action: &str, field: &str) -> crate::error::FarmError {
    use serde::de::Error;
    serde_json::Error::custom(format!("{} envelope missing '{}'", action, field)).into()
}
