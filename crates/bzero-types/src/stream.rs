//! Sequenced stream frames exchanged between plugin action halves.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// One ordered frame of plugin stream traffic.
///
/// Sequence numbers start at 0 per direction. A frame with `more == false`
/// terminates its half of the stream; later sequence numbers must not arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub action: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub more: bool,
    /// Base64-encoded content bytes.
    pub content: String,
}

impl StreamMessage {
    pub fn new(action: &str, stream_type: StreamType, sequence_number: u64, content: &[u8]) -> Self {
        Self {
            schema_version: crate::SCHEMA_VERSION.to_string(),
            sequence_number,
            action: action.to_string(),
            stream_type,
            more: true,
            content: base64::engine::general_purpose::STANDARD.encode(content),
        }
    }

    /// Terminal frame for this half of the stream.
    pub fn terminal(action: &str, stream_type: StreamType, sequence_number: u64) -> Self {
        Self {
            schema_version: crate::SCHEMA_VERSION.to_string(),
            sequence_number,
            action: action.to_string(),
            stream_type,
            more: false,
            content: String::new(),
        }
    }

    /// Decoded content bytes.
    pub fn decode_content(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.content)
    }
}

/// Discriminant of a [`StreamMessage`]. Wire names are protocol-fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Stream,
    StdOut,
    StdErr,
    Data,
    Error,
    Start,
    Stop,
    Ready,
    DbStream,
    DbStreamEnd,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamType::Stream => "Stream",
            StreamType::StdOut => "StdOut",
            StreamType::StdErr => "StdErr",
            StreamType::Data => "Data",
            StreamType::Error => "Error",
            StreamType::Start => "Start",
            StreamType::Stop => "Stop",
            StreamType::Ready => "Ready",
            StreamType::DbStream => "DbStream",
            StreamType::DbStreamEnd => "DbStreamEnd",
        };
        write!(f, "{}", name)
    }
}
