//! Wire message format and id generation.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Enumerated event kinds carried on the wire. `Custom` covers event kinds
/// defined by business collaborators outside this crate's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Letter,
    Courier,
    Task,
    UserOnline,
    UserOffline,
    System,
    Heartbeat,
    Error,
    Connected,
    Disconnected,
    #[serde(untagged)]
    Custom(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_value(self) {
            Ok(JsonValue::String(s)) => write!(f, "{s}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// Immutable wire message, identical in shape to the JSON the HTTP/WS edge
/// sends and receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: JsonValue,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl Message {
    pub fn new(event_type: EventType, data: JsonValue, user_id: Option<String>, room: Option<String>) -> Self {
        Self { id: generate_message_id(), event_type, data, timestamp: Utc::now(), user_id, room }
    }
}

/// `msg_<yyyymmddHHMMSS>_<8 alnum>`. The random suffix is drawn from a
/// proper RNG (`rand`), not a nanosecond-derived per-character index, which
/// would be biased and collision-prone under bursts.
pub fn generate_message_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..8).map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char).collect();
    format!("msg_{}_{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_matches_format() {
        let id = generate_message_id();
        assert!(id.starts_with("msg_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 14);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn message_ids_are_unique_under_burst() {
        let ids: std::collections::HashSet<_> = (0..500).map(|_| generate_message_id()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn event_type_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&EventType::UserOnline).unwrap();
        assert_eq!(json, "\"USER_ONLINE\"");
    }
}
