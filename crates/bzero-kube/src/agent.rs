//! Agent side: forward REST traffic to the API server.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{StreamMessage, TunnelError};

use crate::{subactions, KubeRestRequest, KubeRestResponse};

/// Sends one request to the API server under the agent's service account.
#[async_trait]
pub trait RestForwarder: Send + Sync {
    async fn forward(&self, request: &KubeRestRequest) -> Result<KubeRestResponse, TunnelError>;
}

/// In-cluster forwarder: service-account bearer token plus the cluster CA.
pub struct InClusterForwarder {
    client: reqwest::Client,
    api_server: String,
    token: String,
}

impl InClusterForwarder {
    /// `api_server` like `https://kubernetes.default.svc`; `ca_pem` and
    /// `token` from the mounted service-account volume, read once at
    /// startup by the service.
    pub fn new(api_server: &str, ca_pem: &[u8], token: &str) -> Result<Self, TunnelError> {
        let certificate = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| TunnelError::Internal(format!("bad cluster CA: {}", e)))?;
        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|e| TunnelError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl RestForwarder for InClusterForwarder {
    async fn forward(&self, request: &KubeRestRequest) -> Result<KubeRestResponse, TunnelError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::Internal(format!("bad method {}", request.method)))?;
        let mut url = format!("{}{}", self.api_server, request.path);
        if !request.query.is_empty() {
            url.push('?');
            url.push_str(&request.query);
        }

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            // hop-by-hop and auth headers stay local
            if name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TunnelError::ConnectionFailed(format!("api server: {}", e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?
            .to_vec();

        Ok(KubeRestResponse {
            status,
            headers,
            body,
        })
    }
}

/// Agent-side kube plugin: answers `kube/request` commands with
/// `kube/response` commands; stream classes are shuttled opaquely.
pub struct KubeAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    forwarder: Arc<dyn RestForwarder>,
}

impl KubeAgentAction {
    pub fn new(forwarder: Arc<dyn RestForwarder>) -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            forwarder,
        }
    }
}

#[async_trait]
impl PluginAction for KubeAgentAction {
    fn action_name(&self) -> &str {
        bzero_types::actions::KUBE_RESTAPI
    }

    async fn start_action(&self, _payload: &[u8]) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::REQUEST => {
                let request: KubeRestRequest = serde_json::from_slice(payload)
                    .map_err(|e| TunnelError::Internal(format!("bad kube request: {}", e)))?;
                tracing::info!(
                    method = %request.method,
                    path = %request.path,
                    log_id = %request.log_id,
                    "forwarding kubectl request"
                );
                let response = self.forwarder.forward(&request).await?;
                let payload = serde_json::to_vec(&response)
                    .map_err(|e| TunnelError::Internal(e.to_string()))?;
                self.outbox
                    .send(PluginMessage::Command {
                        subaction: subactions::RESPONSE.into(),
                        payload,
                    })
                    .await?;
                Ok(Vec::new())
            }
            other => Err(TunnelError::Internal(format!(
                "unhandled kube subaction '{}'",
                other
            ))),
        }
    }

    async fn receive_stream(&self, _msg: StreamMessage) {}

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.tomb.kill(if reason.is_empty() {
            None
        } else {
            Some(reason.to_string())
        });
        self.tomb.mark_dead();
    }

    fn tomb(&self) -> &Tomb {
        &self.tomb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticForwarder;

    #[async_trait]
    impl RestForwarder for StaticForwarder {
        async fn forward(
            &self,
            request: &KubeRestRequest,
        ) -> Result<KubeRestResponse, TunnelError> {
            Ok(KubeRestResponse {
                status: 200,
                headers: vec![],
                body: format!("{} {}", request.method, request.path).into_bytes(),
            })
        }
    }

    #[tokio::test]
    async fn test_request_command_produces_response_command() {
        let action = KubeAgentAction::new(Arc::new(StaticForwarder));
        let mut outbox = action.take_outbox().await.unwrap();

        let request = KubeRestRequest {
            method: "GET".into(),
            path: "/api/v1/pods".into(),
            query: String::new(),
            headers: vec![],
            body: vec![],
            log_id: "log-1".into(),
            command: "kubectl get pods".into(),
        };
        action
            .receive(subactions::REQUEST, &serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();

        match outbox.recv().await.unwrap() {
            PluginMessage::Command { subaction, payload } => {
                assert_eq!(subaction, subactions::RESPONSE);
                let response: KubeRestResponse = serde_json::from_slice(&payload).unwrap();
                assert_eq!(response.status, 200);
                assert_eq!(response.body, b"GET /api/v1/pods");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_subaction_rejected() {
        let action = KubeAgentAction::new(Arc::new(StaticForwarder));
        assert!(action.receive("kube/unknown", &[]).await.is_err());
    }
}
