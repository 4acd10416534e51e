//! Messages exchanged with a session's client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::payload::ComponentBatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// New values for components, keyed by component id.
    StateUpdate { updates: BTreeMap<String, Value> },
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Components { batch: ComponentBatch },
    Error { message: String },
}

/// Raw state changes relayed between sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub origin: u64,
    pub changes: BTreeMap<String, Value>,
}

pub(crate) fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Encode(e.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let message: ClientMessage =
            decode(r#"{"type":"state_update","updates":{"slider-1":4}}"#).unwrap();
        let mut updates = BTreeMap::new();
        updates.insert("slider-1".to_string(), json!(4));
        assert_eq!(message, ClientMessage::StateUpdate { updates });

        assert_eq!(decode::<ClientMessage>(r#"{"type":"close"}"#).unwrap(), ClientMessage::Close);
    }

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::Components {
            batch: ComponentBatch::Plain { components: Vec::new() },
        };
        let encoded: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"type": "components", "batch": {"encoding": "plain", "components": []}})
        );
    }

    #[test]
    fn test_decode_error() {
        let err = decode::<ClientMessage>("{\"type\":\"nope\"}").unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }
}
