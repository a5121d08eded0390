//! The keysplitting seam.
//!
//! The MrTAP handshake itself is an external collaborator; the datachannel
//! only needs two operations from it: wrap an outgoing payload into a
//! verified message of the right kind, and verify an incoming one back into
//! `(action, payload)`. Implementations own all cryptographic state.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Which leg of the verified exchange a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Syn,
    SynAck,
    Data,
    DataAck,
}

#[async_trait]
pub trait Handshaker: Send + Sync {
    /// Wrap `payload` for sending. Returns the serialized verified message.
    async fn build(&self, kind: HandshakeKind, action: &str, payload: &[u8])
        -> Result<Vec<u8>, String>;

    /// Verify an incoming message and unwrap it to `(action, payload)`.
    /// A verification failure is fatal to the datachannel.
    async fn verify(&self, kind: HandshakeKind, message: &[u8])
        -> Result<(String, Vec<u8>), String>;
}

/// Pass-through handshaker carrying `(action, payload)` in a plain JSON
/// envelope. Used by tests and by deployments that delegate verification
/// to the coordinator.
#[derive(Debug, Default, Clone)]
pub struct NoopHandshaker;

#[derive(Serialize, Deserialize)]
struct Envelope {
    action: String,
    payload: String,
}

#[async_trait]
impl Handshaker for NoopHandshaker {
    async fn build(
        &self,
        _kind: HandshakeKind,
        action: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&Envelope {
            action: action.to_string(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
        })
        .map_err(|e| e.to_string())
    }

    async fn verify(
        &self,
        _kind: HandshakeKind,
        message: &[u8],
    ) -> Result<(String, Vec<u8>), String> {
        let envelope: Envelope = serde_json::from_slice(message).map_err(|e| e.to_string())?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(&envelope.payload)
            .map_err(|e| e.to_string())?;
        Ok((envelope.action, payload))
    }
}
