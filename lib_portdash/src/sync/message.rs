//! # Inbound Push Messages
//!
//! Wire envelope for the frames the backend pushes over the dashboard socket,
//! and the fixed table that maps a message type to the logical resource whose
//! listeners should be told about it.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource key for account notifications.
pub const ACCOUNTS: &str = "accounts";
/// Resource key for container notifications.
pub const CONTAINERS: &str = "containers";
/// Resource key for overall system status notifications.
pub const SYSTEM_STATUS: &str = "system_status";

/// The closed set of message tags the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// An account (balances, positions) changed server-side.
    AccountUpdate,
    /// Overall backend health changed.
    SystemStatus,
    /// A managed container changed state.
    ContainerStatus,
    /// The backend reports a failure on its side.
    Error,
    /// Any tag outside the set above.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Maps a message type to the resource key its listeners subscribe under.
    ///
    /// `Error` and `Unknown` have no resource and are never dispatched.
    pub fn resource(self) -> Option<&'static str> {
        match self {
            MessageType::AccountUpdate => Some(ACCOUNTS),
            MessageType::ContainerStatus => Some(CONTAINERS),
            MessageType::SystemStatus => Some(SYSTEM_STATUS),
            MessageType::Error | MessageType::Unknown => None,
        }
    }
}

/// A parsed push frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Declared message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Type-specific payload, passed to listeners untouched.
    #[serde(default)]
    pub data: Value,
    /// ISO-8601 timestamp as sent by the server.
    #[serde(default)]
    pub timestamp: String,
}

impl InboundMessage {
    /// Parses a raw text frame.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// The server timestamp, if it is valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_account_update() {
        let frame = r#"{"type":"account_update","data":{"account_id":"DU1"},"timestamp":"2024-05-01T12:00:00Z"}"#;
        let msg = InboundMessage::parse(frame).unwrap();

        assert_eq!(msg.kind, MessageType::AccountUpdate);
        assert_eq!(msg.data, json!({"account_id": "DU1"}));
        assert_eq!(msg.kind.resource(), Some(ACCOUNTS));
        assert!(msg.parsed_timestamp().is_some());
    }

    #[test]
    fn test_unknown_type_has_no_resource() {
        let msg = InboundMessage::parse(r#"{"type":"order_fill","data":{}}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert_eq!(msg.kind.resource(), None);
        assert_eq!(MessageType::Error.resource(), None);
    }

    #[test]
    fn test_malformed_frames_fail_to_parse() {
        assert!(InboundMessage::parse("{not json").is_err());
        assert!(InboundMessage::parse(r#"{"data":{}}"#).is_err());
        assert!(InboundMessage::parse("[1,2,3]").is_err());
    }
}
