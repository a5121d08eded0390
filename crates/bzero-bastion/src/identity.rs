//! The agent identity token: cached, verified, refreshed.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_config::{AgentData, Backend, ConfigError, ConfigStore};
use bzero_crypto::IdentityKeypair;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::client::BastionClient;
use crate::{BastionError, BastionResult};

/// Decides whether a cached token is still good. The default implementation
/// checks an ES256 signature against the bastion JWKS.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> bool;
}

/// JWKS-backed verifier. The key set is fetched once and reused so repeated
/// verifications do not hammer the endpoint.
pub struct JwksVerifier {
    http: reqwest::Client,
    jwks_url: String,
    cached: Mutex<Option<jsonwebtoken::jwk::JwkSet>>,
}

impl JwksVerifier {
    pub fn new(jwks_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_url: jwks_url.to_string(),
            cached: Mutex::new(None),
        }
    }

    async fn key_set(&self) -> Option<jsonwebtoken::jwk::JwkSet> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            let fetched = self
                .http
                .get(&self.jwks_url)
                .send()
                .await
                .ok()?
                .json::<jsonwebtoken::jwk::JwkSet>()
                .await
                .ok()?;
            *cached = Some(fetched);
        }
        cached.clone()
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let Some(key_set) = self.key_set().await else {
            return false;
        };
        let Ok(header) = jsonwebtoken::decode_header(token) else {
            return false;
        };
        let jwk = match header.kid.as_deref().and_then(|kid| key_set.find(kid)) {
            Some(jwk) => jwk,
            None => match key_set.keys.first() {
                Some(jwk) => jwk,
                None => return false,
            },
        };
        let Ok(key) = jsonwebtoken::DecodingKey::from_jwk(jwk) else {
            return false;
        };
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
        validation.validate_aud = false;
        jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation).is_ok()
    }
}

/// The signed request body for a fresh identity token.
#[derive(Debug, Serialize)]
struct GetAgentIdentityToken<'a> {
    #[serde(rename = "TargetId")]
    target_id: &'a str,
    #[serde(rename = "AgentPublicKey")]
    agent_public_key: String,
}

/// Serves the agent identity token: the cached one while it still
/// verifies, a freshly signed-for one otherwise. Fresh tokens are persisted
/// to the durable config.
pub struct IdentityProvider<B> {
    client: Arc<BastionClient>,
    config: Arc<ConfigStore<B>>,
    verifier: Arc<dyn TokenVerifier>,
    keypair: IdentityKeypair,
    target_id: String,
}

impl<B: Backend<AgentData>> IdentityProvider<B> {
    pub fn new(
        client: Arc<BastionClient>,
        config: Arc<ConfigStore<B>>,
        verifier: Arc<dyn TokenVerifier>,
        keypair: IdentityKeypair,
        target_id: &str,
    ) -> Self {
        Self {
            client,
            config,
            verifier,
            keypair,
            target_id: target_id.to_string(),
        }
    }

    /// The current valid token. On a 401 from a bastion call, callers
    /// invoke [`IdentityProvider::refresh`] once and retry.
    pub async fn token(&self) -> BastionResult<String> {
        let cached = self.config.agent_identity_token().await;
        if self.verifier.verify(&cached).await {
            return Ok(cached);
        }
        self.refresh().await
    }

    /// Force-fetch a fresh token and persist it.
    pub async fn refresh(&self) -> BastionResult<String> {
        let message = GetAgentIdentityToken {
            target_id: &self.target_id,
            agent_public_key: self.keypair.public_key_base64(),
        };
        let message_json =
            serde_json::to_vec(&message).map_err(|e| BastionError::Identity(e.to_string()))?;
        let signature = self.keypair.sign_base64(&message_json);

        let token = self
            .client
            .get_agent_identity_token(&self.target_id, &message_json, &signature)
            .await?;

        match self.config.set_agent_identity_token(&token).await {
            Ok(()) | Err(ConfigError::NoOp) => {}
            Err(e) => return Err(BastionError::Identity(e.to_string())),
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubVerifier {
        valid: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenVerifier for &'static StubVerifier {
        async fn verify(&self, _token: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.valid.load(Ordering::SeqCst)
        }
    }

    // the config store's in-memory mock backend lives in bzero-config's
    // tests; a tiny local one keeps this test self-contained
    struct MemoryBackend(std::sync::Mutex<Vec<u8>>);

    #[async_trait]
    impl Backend<AgentData> for MemoryBackend {
        async fn fetch(&self) -> Result<AgentData, ConfigError> {
            bzero_config::Record::decode(&self.0.lock().unwrap())
        }

        async fn save(&self, record: &AgentData) -> Result<(), ConfigError> {
            *self.0.lock().unwrap() = bzero_config::Record::encode(record)?;
            Ok(())
        }
    }

    async fn identity_server() -> String {
        let router = Router::new().route(
            "/api/v2/agent/identity/:target",
            get(|| async { Json(serde_json::json!({"Token": "fresh-token"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_valid_cached_token_is_reused() {
        static VERIFIER: StubVerifier = StubVerifier {
            valid: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        };
        let config = Arc::new(
            ConfigStore::load(MemoryBackend(std::sync::Mutex::new(Vec::new())))
                .await
                .unwrap(),
        );
        config.set_agent_identity_token("cached-token").await.unwrap();

        let provider = IdentityProvider::new(
            Arc::new(BastionClient::new("http://127.0.0.1:1")),
            config,
            Arc::new(&VERIFIER),
            IdentityKeypair::generate(),
            "t1",
        );
        assert_eq!(provider.token().await.unwrap(), "cached-token");
        assert!(VERIFIER.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_stale_token_refreshes_and_persists() {
        static VERIFIER: StubVerifier = StubVerifier {
            valid: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        };
        let base = identity_server().await;
        let config = Arc::new(
            ConfigStore::load(MemoryBackend(std::sync::Mutex::new(Vec::new())))
                .await
                .unwrap(),
        );
        config.set_agent_identity_token("stale").await.unwrap();

        let provider = IdentityProvider::new(
            Arc::new(BastionClient::new(&base)),
            Arc::clone(&config),
            Arc::new(&VERIFIER),
            IdentityKeypair::generate(),
            "t1",
        );
        assert_eq!(provider.token().await.unwrap(), "fresh-token");
        assert_eq!(config.agent_identity_token().await, "fresh-token");
    }

    #[test]
    fn test_jwks_parses_static_key_set() {
        let jwks: jsonwebtoken::jwk::JwkSet = serde_json::from_str(
            r#"{"keys":[{"kty":"EC","crv":"P-256","kid":"k1",
                "x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
                "y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"}]}"#,
        )
        .unwrap();
        assert!(jwks.find("k1").is_some());
    }
}
