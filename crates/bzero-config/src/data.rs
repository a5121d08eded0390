//! The agent configuration record and its schema history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::backend::Record;
use crate::error::{ConfigError, ConfigResult};

/// Where this agent runs. Immutable after install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentType {
    Linux,
    Windows,
    Kubernetes,
}

impl Default for AgentType {
    fn default() -> Self {
        AgentType::Linux
    }
}

/// The durable agent configuration, current schema (v2).
///
/// Field names match the stored document; changing them breaks every
/// installed agent's config on upgrade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "AgentType", default)]
    pub agent_type: AgentType,
    #[serde(rename = "PublicKey", default)]
    pub public_key: String,
    #[serde(rename = "PrivateKey", default)]
    pub private_key: String,
    #[serde(rename = "AgentIdentityToken", default)]
    pub agent_identity_token: String,
    #[serde(rename = "TargetId", default)]
    pub target_id: String,
    #[serde(rename = "ServiceUrl", default)]
    pub service_url: String,
    #[serde(rename = "IdpProvider", default)]
    pub idp_provider: String,
    #[serde(rename = "IdpOrgId", default)]
    pub idp_org_id: String,
    #[serde(rename = "ShutdownReason", default)]
    pub shutdown_reason: String,
    #[serde(rename = "ShutdownState", default)]
    pub shutdown_state: HashMap<String, String>,
    #[serde(rename = "JwksUrlPatterns", default)]
    pub jwks_url_patterns: Vec<String>,
}

/// Legacy schema (v1): `ShutdownState` held a pre-formatted string. The
/// string is never parsed; migration discards it.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentDataV1 {
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "AgentType", default)]
    agent_type: AgentType,
    #[serde(rename = "PublicKey", default)]
    public_key: String,
    #[serde(rename = "PrivateKey", default)]
    private_key: String,
    #[serde(rename = "AgentIdentityToken", default)]
    agent_identity_token: String,
    #[serde(rename = "TargetId", default)]
    target_id: String,
    #[serde(rename = "ServiceUrl", default)]
    service_url: String,
    #[serde(rename = "IdpProvider", default)]
    idp_provider: String,
    #[serde(rename = "IdpOrgId", default)]
    idp_org_id: String,
    #[serde(rename = "ShutdownReason", default)]
    shutdown_reason: String,
    #[serde(rename = "ShutdownState", default)]
    _shutdown_state: String,
}

impl From<AgentDataV1> for AgentData {
    fn from(v1: AgentDataV1) -> Self {
        AgentData {
            version: v1.version,
            agent_type: v1.agent_type,
            public_key: v1.public_key,
            private_key: v1.private_key,
            agent_identity_token: v1.agent_identity_token,
            target_id: v1.target_id,
            service_url: v1.service_url,
            idp_provider: v1.idp_provider,
            idp_org_id: v1.idp_org_id,
            shutdown_reason: v1.shutdown_reason,
            shutdown_state: HashMap::new(),
            jwks_url_patterns: Vec::new(),
        }
    }
}

impl Record for AgentData {
    fn decode(bytes: &[u8]) -> ConfigResult<Self> {
        if bytes.is_empty() {
            return Ok(AgentData::default());
        }
        match serde_json::from_slice::<AgentData>(bytes) {
            Ok(data) => Ok(data),
            Err(v2_err) => match serde_json::from_slice::<AgentDataV1>(bytes) {
                Ok(v1) => {
                    tracing::info!("migrated legacy v1 agent config");
                    Ok(v1.into())
                }
                Err(_) => Err(ConfigError::Decode(v2_err.to_string())),
            },
        }
    }

    fn encode(&self) -> ConfigResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConfigError::Encode(e.to_string()))
    }
}

/// The fields written together when the agent (re-)registers.
#[derive(Debug, Clone)]
pub struct RegistrationData {
    pub public_key: String,
    pub private_key: String,
    pub target_id: String,
    pub service_url: String,
    pub idp_provider: String,
    pub idp_org_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> AgentData {
        AgentData {
            version: "7.1.0".into(),
            agent_type: AgentType::Kubernetes,
            public_key: "pub".into(),
            private_key: "priv".into(),
            agent_identity_token: "token".into(),
            target_id: "t1".into(),
            service_url: "https://cloud.example.com".into(),
            idp_provider: "google".into(),
            idp_org_id: "org-1".into(),
            shutdown_reason: "upgrade".into(),
            shutdown_state: HashMap::from([("signal".into(), "SIGTERM".into())]),
            jwks_url_patterns: vec!["https://example.com/jwks/*".into()],
        }
    }

    #[test]
    fn test_v2_roundtrip() {
        let data = populated();
        let bytes = data.encode().unwrap();
        assert_eq!(AgentData::decode(&bytes).unwrap(), data);
    }

    #[test]
    fn test_empty_sentinel_is_uninitialized() {
        assert_eq!(AgentData::decode(b"").unwrap(), AgentData::default());
    }

    #[test]
    fn test_legacy_v1_migrates_with_empty_shutdown_state() {
        let legacy = r#"{
            "Version": "5.0.0",
            "AgentType": "Linux",
            "TargetId": "t9",
            "ShutdownState": "reason: upgrade, time: 2022-01-01"
        }"#;
        let data = AgentData::decode(legacy.as_bytes()).unwrap();
        assert_eq!(data.version, "5.0.0");
        assert_eq!(data.target_id, "t9");
        assert!(data.shutdown_state.is_empty());
        assert!(data.jwks_url_patterns.is_empty());
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            AgentData::decode(b"not-json"),
            Err(ConfigError::Decode(_))
        ));
    }
}
