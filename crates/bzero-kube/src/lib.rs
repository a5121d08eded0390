//! BastionZero Kube - kubectl traffic over per-request datachannels
//!
//! The daemon runs a local HTTPS listener that kubectl points at. Every
//! incoming request is classified, authorized against the localhost token,
//! and carried over a freshly opened datachannel; the agent side forwards
//! REST traffic to the API server under its service account. Exec and
//! portforward sessions are carried as opaque framed streams — their
//! protocol internals are the Kubernetes client's business, not ours.

pub mod agent;
pub mod daemon;

pub use agent::{InClusterForwarder, KubeAgentAction, RestForwarder};
pub use daemon::{KubeChannelOpener, KubeDaemonAction};

use serde::{Deserialize, Serialize};

/// How a kubectl request travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestClass {
    Exec,
    PortForward,
    Stream,
    RestApi,
}

impl RequestClass {
    /// The action name a request of this class opens its channel with.
    pub fn action(&self) -> &'static str {
        use bzero_types::actions;
        match self {
            RequestClass::Exec => actions::KUBE_EXEC,
            RequestClass::PortForward => actions::KUBE_PORTFORWARD,
            RequestClass::Stream => actions::KUBE_STREAM,
            RequestClass::RestApi => actions::KUBE_RESTAPI,
        }
    }
}

/// Classify by URL suffix and query parameters, the way kubectl shapes its
/// requests: `.../exec` and `.../portforward` suffixes, streaming reads
/// (`follow=true`, `watch=true`), everything else plain REST.
pub fn classify_request(path: &str, query: &str) -> RequestClass {
    let trimmed = path.trim_end_matches('/');
    if trimmed.ends_with("/exec") || trimmed.ends_with("/attach") {
        return RequestClass::Exec;
    }
    if trimmed.ends_with("/portforward") {
        return RequestClass::PortForward;
    }
    let has_flag = |flag: &str| {
        query
            .split('&')
            .any(|pair| pair == format!("{}=true", flag) || pair == flag)
    };
    if has_flag("follow") || has_flag("watch") {
        return RequestClass::Stream;
    }
    RequestClass::RestApi
}

/// The daemon's Authorization bearer, split on `++++` into
/// `{localhostToken, command, logId}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeBearer {
    pub localhost_token: String,
    pub command: String,
    pub log_id: String,
}

impl KubeBearer {
    pub fn parse(header_value: &str) -> Option<Self> {
        let token = header_value.strip_prefix("Bearer ")?;
        let mut parts = token.split("++++");
        let localhost_token = parts.next()?.to_string();
        let command = parts.next()?.to_string();
        let log_id = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            localhost_token,
            command,
            log_id,
        })
    }
}

/// One REST request as it crosses the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeRestRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    #[serde(rename = "logId")]
    pub log_id: String,
    pub command: String,
}

/// The matching response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeRestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

mod body_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Subactions under `kube/*`.
pub mod subactions {
    pub const REQUEST: &str = "kube/request";
    pub const RESPONSE: &str = "kube/response";
    pub const STREAM_DATA: &str = "kube/streamdata";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            classify_request("/api/v1/namespaces/default/pods/web/exec", "command=ls"),
            RequestClass::Exec
        );
        assert_eq!(
            classify_request("/api/v1/namespaces/default/pods/web/portforward", ""),
            RequestClass::PortForward
        );
        assert_eq!(
            classify_request("/api/v1/namespaces/default/pods/web/log", "follow=true"),
            RequestClass::Stream
        );
        assert_eq!(
            classify_request("/api/v1/pods", "watch=true"),
            RequestClass::Stream
        );
        assert_eq!(
            classify_request("/api/v1/namespaces/default/pods", "limit=500"),
            RequestClass::RestApi
        );
    }

    #[test]
    fn test_bearer_parse() {
        let bearer =
            KubeBearer::parse("Bearer secret-token++++kubectl get pods++++log-123").unwrap();
        assert_eq!(bearer.localhost_token, "secret-token");
        assert_eq!(bearer.command, "kubectl get pods");
        assert_eq!(bearer.log_id, "log-123");

        assert!(KubeBearer::parse("Bearer only-token").is_none());
        assert!(KubeBearer::parse("Basic abc").is_none());
        assert!(KubeBearer::parse("Bearer a++++b++++c++++d").is_none());
    }

    #[test]
    fn test_rest_request_roundtrip() {
        let request = KubeRestRequest {
            method: "GET".into(),
            path: "/api/v1/pods".into(),
            query: "limit=1".into(),
            headers: vec![("accept".into(), "application/json".into())],
            body: b"{}".to_vec(),
            log_id: "log-1".into(),
            command: "kubectl get pods".into(),
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let back: KubeRestRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.body, b"{}");
        assert_eq!(back.path, request.path);
    }
}
