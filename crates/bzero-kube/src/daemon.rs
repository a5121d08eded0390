//! Daemon side: the local listener kubectl talks to.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{StreamMessage, TunnelError};
use tokio::sync::{oneshot, Mutex};

use crate::{
    classify_request, subactions, KubeBearer, KubeRestRequest, KubeRestResponse, RequestClass,
};

/// Opens a fresh datachannel for one classified kubectl request. The daemon
/// service implements this over its transport.
#[async_trait]
pub trait KubeChannelOpener: Send + Sync {
    async fn open(
        &self,
        class: RequestClass,
        plugin: Arc<KubeDaemonAction>,
    ) -> Result<(), TunnelError>;
}

/// Daemon-side plugin for one kubectl request. REST requests resolve a
/// oneshot with the agent's response; stream classes pipe frames through.
pub struct KubeDaemonAction {
    outbox: Outbox,
    tomb: Tomb,
    response_tx: Mutex<Option<oneshot::Sender<KubeRestResponse>>>,
}

impl KubeDaemonAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            response_tx: Mutex::new(None),
        })
    }

    /// Send the request and wait for the agent's response.
    pub async fn execute_rest(
        self: &Arc<Self>,
        request: KubeRestRequest,
    ) -> Result<KubeRestResponse, TunnelError> {
        let (tx, rx) = oneshot::channel();
        *self.response_tx.lock().await = Some(tx);

        let payload = serde_json::to_vec(&request)
            .map_err(|e| TunnelError::Internal(e.to_string()))?;
        self.outbox
            .send(PluginMessage::Command {
                subaction: subactions::REQUEST.into(),
                payload,
            })
            .await?;

        tokio::select! {
            response = rx => response.map_err(|_| TunnelError::Internal("kube channel closed before response".into())),
            _ = self.tomb.dying() => Err(TunnelError::Internal(
                self.tomb.err().unwrap_or_else(|| "kube channel died".into()),
            )),
        }
    }
}

#[async_trait]
impl PluginAction for KubeDaemonAction {
    fn action_name(&self) -> &str {
        bzero_types::actions::KUBE_RESTAPI
    }

    async fn start_action(&self, _payload: &[u8]) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if subaction == subactions::RESPONSE {
            let response: KubeRestResponse = serde_json::from_slice(payload)
                .map_err(|e| TunnelError::Internal(format!("bad kube response: {}", e)))?;
            if let Some(tx) = self.response_tx.lock().await.take() {
                let _ = tx.send(response);
            }
        }
        Ok(Vec::new())
    }

    async fn receive_stream(&self, _msg: StreamMessage) {
        // exec/portforward/stream frames are consumed by the class-specific
        // handlers in the daemon service; REST never sees streams
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.response_tx.lock().await.take();
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

#[derive(Clone)]
struct ListenerState {
    expected_token: String,
    opener: Arc<dyn KubeChannelOpener>,
}

/// The router the daemon service serves on the kubectl port.
pub fn listener_router(expected_token: &str, opener: Arc<dyn KubeChannelOpener>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(ListenerState {
            expected_token: expected_token.to_string(),
            opener,
        })
}

async fn handle_request(State(state): State<ListenerState>, request: Request) -> Response {
    let Some(bearer) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(KubeBearer::parse)
    else {
        return status_response(StatusCode::UNAUTHORIZED, "malformed bearer token");
    };
    if bearer.localhost_token != state.expected_token {
        return status_response(StatusCode::UNAUTHORIZED, "unexpected localhost token");
    }

    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let class = classify_request(&path, &query);

    let method = request.method().to_string();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter(|(name, _)| *name != axum::http::header::AUTHORIZATION)
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let body = match axum::body::to_bytes(request.into_body(), 8 * 1024 * 1024).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    match class {
        RequestClass::RestApi => {
            // one fresh datachannel per request
            let plugin = KubeDaemonAction::new();
            if let Err(e) = state.opener.open(class, Arc::clone(&plugin)).await {
                return status_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
            let rest = KubeRestRequest {
                method,
                path,
                query,
                headers,
                body,
                log_id: bearer.log_id,
                command: bearer.command,
            };
            match plugin.execute_rest(rest).await {
                Ok(response) => rest_response(response),
                Err(e) => status_response(StatusCode::BAD_GATEWAY, &e.to_string()),
            }
        }
        // exec/portforward/stream upgrades are carried by the service's
        // stream pumps, which hijack the connection before this handler
        _ => status_response(
            StatusCode::NOT_IMPLEMENTED,
            "streaming classes are carried by the stream pumps",
        ),
    }
}

fn rest_response(response: KubeRestResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY, "bad agent response"))
}

fn status_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .expect("static response builds")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct EchoOpener;

    #[async_trait]
    impl KubeChannelOpener for EchoOpener {
        async fn open(
            &self,
            _class: RequestClass,
            plugin: Arc<KubeDaemonAction>,
        ) -> Result<(), TunnelError> {
            // fake agent: answer every REST request with its own path
            let plugin_clone = Arc::clone(&plugin);
            tokio::spawn(async move {
                let mut outbox = plugin_clone.take_outbox().await.unwrap();
                while let Some(msg) = outbox.recv().await {
                    if let PluginMessage::Command { subaction, payload } = msg {
                        if subaction == subactions::REQUEST {
                            let request: KubeRestRequest =
                                serde_json::from_slice(&payload).unwrap();
                            let response = KubeRestResponse {
                                status: 200,
                                headers: vec![("content-type".into(), "text/plain".into())],
                                body: request.path.into_bytes(),
                            };
                            let _ = plugin_clone
                                .receive(
                                    subactions::RESPONSE,
                                    &serde_json::to_vec(&response).unwrap(),
                                )
                                .await;
                        }
                    }
                }
            });
            Ok(())
        }
    }

    fn request(path: &str, token: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(
                "authorization",
                format!("Bearer {}++++kubectl get pods++++log-1", token),
            )
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rest_request_roundtrips_through_channel() {
        let router = listener_router("expected", Arc::new(EchoOpener));
        let response = router
            .oneshot(request("/api/v1/namespaces/default/pods", "expected"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/api/v1/namespaces/default/pods");
    }

    #[tokio::test]
    async fn test_wrong_localhost_token_unauthorized() {
        let router = listener_router("expected", Arc::new(EchoOpener));
        let response = router
            .oneshot(request("/api/v1/pods", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_bearer_unauthorized() {
        let router = listener_router("expected", Arc::new(EchoOpener));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/v1/pods")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
