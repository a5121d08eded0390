//! The typed agent configuration store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::backend::{fetch_with_retry, save_with_retry, Backend};
use crate::data::{AgentData, AgentType, RegistrationData};
use crate::error::{ConfigError, ConfigResult};

/// Concurrency-safe view of the durable [`AgentData`] record.
///
/// Getters read an in-memory copy cached at [`ConfigStore::load`] /
/// [`ConfigStore::reload`] time under a shared lock. Setters serialize on an
/// exclusive lock, re-fetch the record from the backend, apply the mutation
/// to the fresh copy, and save — so concurrent writers (including other
/// processes) never lose updates they raced with.
pub struct ConfigStore<B> {
    backend: Arc<B>,
    cache: RwLock<AgentData>,
    write_lock: Mutex<()>,
}

impl<B: Backend<AgentData>> ConfigStore<B> {
    /// Load the record from `backend` and build the store around it.
    pub async fn load(backend: B) -> ConfigResult<Self> {
        let backend = Arc::new(backend);
        let data = fetch_with_retry(backend.as_ref()).await?;
        Ok(Self {
            backend,
            cache: RwLock::new(data),
            write_lock: Mutex::new(()),
        })
    }

    /// Refresh the cached record from the backend.
    pub async fn reload(&self) -> ConfigResult<()> {
        let fresh = fetch_with_retry(self.backend.as_ref()).await?;
        *self.cache.write().await = fresh;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Getters (shared lock on the cached record)
    // ------------------------------------------------------------------

    pub async fn version(&self) -> String {
        self.cache.read().await.version.clone()
    }

    pub async fn agent_type(&self) -> AgentType {
        self.cache.read().await.agent_type
    }

    pub async fn public_key(&self) -> String {
        self.cache.read().await.public_key.clone()
    }

    pub async fn private_key(&self) -> String {
        self.cache.read().await.private_key.clone()
    }

    pub async fn agent_identity_token(&self) -> String {
        self.cache.read().await.agent_identity_token.clone()
    }

    pub async fn target_id(&self) -> String {
        self.cache.read().await.target_id.clone()
    }

    pub async fn service_url(&self) -> String {
        self.cache.read().await.service_url.clone()
    }

    pub async fn idp_provider(&self) -> String {
        self.cache.read().await.idp_provider.clone()
    }

    pub async fn idp_org_id(&self) -> String {
        self.cache.read().await.idp_org_id.clone()
    }

    pub async fn shutdown_info(&self) -> (String, HashMap<String, String>) {
        let data = self.cache.read().await;
        (data.shutdown_reason.clone(), data.shutdown_state.clone())
    }

    pub async fn jwks_url_patterns(&self) -> Vec<String> {
        self.cache.read().await.jwks_url_patterns.clone()
    }

    // ------------------------------------------------------------------
    // Setters (exclusive lock, fetch-modify-save)
    // ------------------------------------------------------------------

    pub async fn set_version(&self, version: &str) -> ConfigResult<()> {
        self.mutate(|data| {
            if data.version == version {
                return Err(ConfigError::NoOp);
            }
            data.version = version.to_string();
            Ok(())
        })
        .await
    }

    pub async fn set_agent_identity_token(&self, token: &str) -> ConfigResult<()> {
        self.mutate(|data| {
            if data.agent_identity_token == token {
                return Err(ConfigError::NoOp);
            }
            data.agent_identity_token = token.to_string();
            Ok(())
        })
        .await
    }

    /// Record why the agent is going down; consumed once on next boot.
    pub async fn set_shutdown_info(
        &self,
        reason: &str,
        state: HashMap<String, String>,
    ) -> ConfigResult<()> {
        self.mutate(|data| {
            data.shutdown_reason = reason.to_string();
            data.shutdown_state = state;
            Ok(())
        })
        .await
    }

    /// Clear a consumed shutdown record.
    pub async fn clear_shutdown_info(&self) -> ConfigResult<()> {
        self.mutate(|data| {
            if data.shutdown_reason.is_empty() && data.shutdown_state.is_empty() {
                return Err(ConfigError::NoOp);
            }
            data.shutdown_reason.clear();
            data.shutdown_state.clear();
            Ok(())
        })
        .await
    }

    /// Install fresh registration data. A new registration necessarily
    /// invalidates the previous identity token, so it is vacated in the
    /// same save.
    pub async fn set_registration_data(&self, registration: RegistrationData) -> ConfigResult<()> {
        self.mutate(|data| {
            data.public_key = registration.public_key;
            data.private_key = registration.private_key;
            data.target_id = registration.target_id;
            data.service_url = registration.service_url.trim_end_matches('/').to_string();
            data.idp_provider = registration.idp_provider;
            data.idp_org_id = registration.idp_org_id;
            data.agent_identity_token = String::new();
            Ok(())
        })
        .await
    }

    /// Add a JWKS URL pattern trusted to sign service-account tokens.
    /// Invalid URLs are refused; duplicates are silently absorbed.
    pub async fn set_service_account_jwks_url(&self, jwks_url: &str) -> ConfigResult<()> {
        if Url::parse(jwks_url).is_err() {
            return Err(ConfigError::InvalidJwksUrl(jwks_url.to_string()));
        }
        self.mutate(|data| {
            if data.jwks_url_patterns.iter().any(|p| p == jwks_url) {
                return Err(ConfigError::NoOp);
            }
            data.jwks_url_patterns.push(jwks_url.to_string());
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, apply: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut AgentData) -> ConfigResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut fresh = fetch_with_retry(self.backend.as_ref()).await?;
        apply(&mut fresh)?;
        save_with_retry(self.backend.as_ref(), &fresh).await?;
        *self.cache.write().await = fresh;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::backend::{Backend, Record};
    use crate::error::{ConfigError, ConfigResult};

    /// In-memory backend counting saves, so tests can assert that
    /// `NoOp` mutations never reach the backend.
    pub struct MockBackend<T> {
        stored: Mutex<Vec<u8>>,
        pub saves: AtomicUsize,
        pub fail_next_fetch: AtomicUsize,
        _record: std::marker::PhantomData<fn() -> T>,
    }

    impl<T: Record> MockBackend<T> {
        pub fn new() -> Self {
            Self {
                stored: Mutex::new(Vec::new()),
                saves: AtomicUsize::new(0),
                fail_next_fetch: AtomicUsize::new(0),
                _record: std::marker::PhantomData,
            }
        }

        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<T: Record> Backend<T> for MockBackend<T> {
        async fn fetch(&self) -> ConfigResult<T> {
            if self.fail_next_fetch.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(ConfigError::Fetch("injected".into()));
            }
            T::decode(&self.stored.lock().unwrap())
        }

        async fn save(&self, record: &T) -> ConfigResult<()> {
            let bytes = record.encode()?;
            *self.stored.lock().unwrap() = bytes;
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockBackend;
    use super::*;

    async fn store() -> ConfigStore<MockBackend<AgentData>> {
        ConfigStore::load(MockBackend::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get_after_reload() {
        let store = store().await;
        store.set_version("7.2.0").await.unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.version().await, "7.2.0");
    }

    #[tokio::test]
    async fn test_noop_issues_no_save() {
        let store = store().await;
        store.set_version("7.2.0").await.unwrap();
        let saves_before = store.backend.save_count();
        let result = store.set_version("7.2.0").await;
        assert!(matches!(result, Err(ConfigError::NoOp)));
        assert_eq!(store.backend.save_count(), saves_before);
    }

    #[tokio::test]
    async fn test_registration_vacates_identity_token() {
        let store = store().await;
        store.set_agent_identity_token("old-token").await.unwrap();
        store
            .set_registration_data(RegistrationData {
                public_key: "pk".into(),
                private_key: "sk".into(),
                target_id: "t1".into(),
                service_url: "https://cloud.example.com/".into(),
                idp_provider: "google".into(),
                idp_org_id: "org".into(),
            })
            .await
            .unwrap();
        assert_eq!(store.agent_identity_token().await, "");
        // trailing slash normalized away
        assert_eq!(store.service_url().await, "https://cloud.example.com");
    }

    #[tokio::test]
    async fn test_jwks_url_validation_and_dedup() {
        let store = store().await;
        assert!(matches!(
            store.set_service_account_jwks_url("not a url").await,
            Err(ConfigError::InvalidJwksUrl(_))
        ));
        store
            .set_service_account_jwks_url("https://example.com/jwks")
            .await
            .unwrap();
        let second = store.set_service_account_jwks_url("https://example.com/jwks").await;
        assert!(matches!(second, Err(ConfigError::NoOp)));
        assert_eq!(store.jwks_url_patterns().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_once_then_succeeds() {
        let backend: MockBackend<AgentData> = MockBackend::new();
        backend.fail_next_fetch.store(1, std::sync::atomic::Ordering::SeqCst);
        let store = ConfigStore::load(backend).await.unwrap();
        assert_eq!(store.version().await, "");
    }

    #[tokio::test]
    async fn test_shutdown_info_roundtrip() {
        let store = store().await;
        let state = HashMap::from([("signal".to_string(), "SIGTERM".to_string())]);
        store.set_shutdown_info("upgrade", state.clone()).await.unwrap();
        let (reason, stored) = store.shutdown_info().await;
        assert_eq!(reason, "upgrade");
        assert_eq!(stored, state);
        store.clear_shutdown_info().await.unwrap();
        assert!(matches!(
            store.clear_shutdown_info().await,
            Err(ConfigError::NoOp)
        ));
    }
}
