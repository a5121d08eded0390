//! signalR-style framing over the websocket.
//!
//! Every record is a JSON document terminated by `0x1E`. The first exchange
//! is a handshake; afterwards records are invocations, pings, or a close.

use serde::Serialize;
use serde_json::Value;

use crate::{TransportError, TransportResult};

/// Record terminator byte.
pub const RECORD_SEPARATOR: u8 = 0x1e;

const TYPE_INVOCATION: u64 = 1;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// A parsed framing-protocol record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to our handshake. `error` is set when the server refused the
    /// requested protocol.
    HandshakeResponse { error: Option<String> },
    /// A method invocation on the peer.
    Invocation { target: String, arguments: Vec<Value> },
    /// Keepalive.
    Ping,
    /// Server-initiated close with an optional reason.
    Close { error: Option<String> },
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

/// The handshake record sent immediately after the websocket upgrade.
pub fn handshake_record() -> Vec<u8> {
    terminate(serde_json::to_vec(&HandshakeRequest { protocol: "json", version: 1 }).unwrap())
}

/// Encode an invocation record.
pub fn invocation_record(target: &str, argument: &Value) -> Vec<u8> {
    let body = serde_json::json!({
        "type": TYPE_INVOCATION,
        "target": target,
        "arguments": [argument],
    });
    terminate(serde_json::to_vec(&body).unwrap())
}

/// Encode a ping record.
pub fn ping_record() -> Vec<u8> {
    terminate(serde_json::to_vec(&serde_json::json!({ "type": TYPE_PING })).unwrap())
}

fn terminate(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.push(RECORD_SEPARATOR);
    bytes
}

/// Split a websocket message into its terminated records and parse each.
/// Records without a trailing separator are rejected; the transport never
/// buffers partial records across websocket messages.
pub fn parse_records(payload: &[u8]) -> TransportResult<Vec<Frame>> {
    if !payload.is_empty() && payload[payload.len() - 1] != RECORD_SEPARATOR {
        return Err(TransportError::MalformedFrame("unterminated record".into()));
    }
    let mut frames = Vec::new();
    for record in payload.split(|&b| b == RECORD_SEPARATOR) {
        if record.is_empty() {
            continue;
        }
        frames.push(parse_record(record)?);
    }
    Ok(frames)
}

fn parse_record(record: &[u8]) -> TransportResult<Frame> {
    let value: Value = serde_json::from_slice(record)
        .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;

    let Some(frame_type) = value.get("type").and_then(Value::as_u64) else {
        // No "type" field: this is the handshake response object.
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(Frame::HandshakeResponse { error });
    };

    match frame_type {
        TYPE_INVOCATION => {
            let target = value
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::MalformedFrame("invocation without target".into()))?
                .to_string();
            let arguments = value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(Frame::Invocation { target, arguments })
        }
        TYPE_PING => Ok(Frame::Ping),
        TYPE_CLOSE => Ok(Frame::Close {
            error: value.get("error").and_then(Value::as_str).map(str::to_string),
        }),
        other => Err(TransportError::MalformedFrame(format!(
            "unsupported frame type {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_record_terminated() {
        let record = handshake_record();
        assert_eq!(*record.last().unwrap(), RECORD_SEPARATOR);
        let frames = parse_records(&record).unwrap();
        // our own handshake request parses as a handshake response shape
        assert!(matches!(frames[0], Frame::HandshakeResponse { .. }));
    }

    #[test]
    fn test_invocation_roundtrip() {
        let arg = serde_json::json!({"channelId": "c1"});
        let record = invocation_record("ResponseDaemonToBastionV1", &arg);
        let frames = parse_records(&record).unwrap();
        match &frames[0] {
            Frame::Invocation { target, arguments } => {
                assert_eq!(target, "ResponseDaemonToBastionV1");
                assert_eq!(arguments[0], arg);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_multiple_records_in_one_message() {
        let mut payload = ping_record();
        payload.extend(invocation_record("CloseConnection", &serde_json::json!({"reason": "bye"})));
        let frames = parse_records(&payload).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Ping);
    }

    #[test]
    fn test_close_frame() {
        let payload = terminate(b"{\"type\":7,\"error\":\"shutting down\"}".to_vec());
        let frames = parse_records(&payload).unwrap();
        assert_eq!(
            frames[0],
            Frame::Close { error: Some("shutting down".into()) }
        );
    }

    #[test]
    fn test_unterminated_record_rejected() {
        assert!(parse_records(b"{\"type\":6}").is_err());
    }
}
