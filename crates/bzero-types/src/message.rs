//! Transport frames multiplexed over the shared websocket.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The frame carried by every signaling-channel invocation.
///
/// `channel_id` routes the frame to a datachannel subscriber on the receiving
/// side; control frames (`HealthCheck`, `OpenAgentWebsocket`, ...) use an
/// empty channel id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    /// Raw JSON payload, interpreted per `message_type`.
    #[serde(rename = "messagePayload")]
    pub payload: Vec<u8>,
}

impl AgentMessage {
    /// Frame addressed to a datachannel.
    pub fn for_channel(channel_id: &str, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            schema_version: crate::SCHEMA_VERSION.to_string(),
            channel_id: channel_id.to_string(),
            payload,
        }
    }

    /// Control frame with no channel affinity.
    pub fn control(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self::for_channel("", message_type, payload)
    }
}

/// Discriminant of an [`AgentMessage`].
///
/// The wire names are fixed by the coordinator protocol; do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Syn,
    SynAck,
    Data,
    DataAck,
    Error,
    HealthCheck,
    OpenDataChannel,
    CloseDataChannel,
    CloseAllDataChannels,
    OpenAgentWebsocket,
    CloseAgentWebsocket,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Syn => "Syn",
            MessageType::SynAck => "SynAck",
            MessageType::Data => "Data",
            MessageType::DataAck => "DataAck",
            MessageType::Error => "Error",
            MessageType::HealthCheck => "HealthCheck",
            MessageType::OpenDataChannel => "OpenDataChannel",
            MessageType::CloseDataChannel => "CloseDataChannel",
            MessageType::CloseAllDataChannels => "CloseAllDataChannels",
            MessageType::OpenAgentWebsocket => "OpenAgentWebsocket",
            MessageType::CloseAgentWebsocket => "CloseAgentWebsocket",
        };
        write!(f, "{}", name)
    }
}

/// Payload of an `OpenDataChannel` frame: everything the agent needs to stand
/// up the matching plugin action without a MrTAP round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDataChannelPayload {
    pub action: String,
    /// Serialized Syn carried piggyback so attach-capable plugins can start.
    #[serde(rename = "syn")]
    pub syn_payload: Vec<u8>,
}

/// Payload of `CloseDataChannel` / `CloseAgentWebsocket` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePayload {
    pub reason: String,
}

/// Payload of an `Error` frame surfaced to the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Payload of a `HealthCheck` reply from the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    pub alive: bool,
    pub agent_version: String,
}

/// Allocates a fresh channel id. Channel ids are never reused.
pub fn new_channel_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::CloseAllDataChannels).unwrap();
        assert_eq!(json, "\"CloseAllDataChannels\"");
        let back: MessageType = serde_json::from_str("\"SynAck\"").unwrap();
        assert_eq!(back, MessageType::SynAck);
    }

    #[test]
    fn test_agent_message_roundtrip() {
        let msg = AgentMessage::for_channel("chan-1", MessageType::Data, b"payload".to_vec());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"messageType\":\"Data\""));
        assert!(json.contains("\"channelId\":\"chan-1\""));
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_channel_ids_unique() {
        assert_ne!(new_channel_id(), new_channel_id());
    }
}
