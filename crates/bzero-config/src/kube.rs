//! Kubernetes-secret backend with optimistic concurrency.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;

use crate::backend::{Backend, Record};
use crate::error::{ConfigError, ConfigResult};

/// Key holding the serialized agent configuration inside the secret.
pub const AGENT_DATA_KEY: &str = "agent-data";
/// Key holding the serialized key-shard store inside the secret.
pub const KEY_SHARD_KEY: &str = "key-shards";

/// Secret name for a given target.
pub fn secret_name_for(target_name: &str) -> String {
    format!("bctl-{}-secret", target_name)
}

/// Stores the record under one key of a named secret. Every save carries the
/// `resourceVersion` observed by the last fetch, so a concurrent writer
/// turns into a 409 instead of a lost update.
pub struct KubeBackend<T> {
    api: Api<Secret>,
    secret_name: String,
    data_key: String,
    /// resourceVersion seen at the last fetch, None before first contact.
    last_resource_version: Mutex<Option<String>>,
    /// Whether the secret object existed at the last fetch.
    secret_exists: Mutex<bool>,
    _record: PhantomData<fn() -> T>,
}

impl<T> KubeBackend<T> {
    /// `namespace` comes from the `NAMESPACE` env var, read once at startup
    /// by the service and passed in explicitly.
    pub fn new(client: Client, namespace: &str, secret_name: &str, data_key: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            secret_name: secret_name.to_string(),
            data_key: data_key.to_string(),
            last_resource_version: Mutex::new(None),
            secret_exists: Mutex::new(false),
            _record: PhantomData,
        }
    }

    fn build_secret(&self, bytes: Vec<u8>, resource_version: Option<String>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                resource_version,
                ..Default::default()
            },
            data: Some(BTreeMap::from([(self.data_key.clone(), ByteString(bytes))])),
            ..Default::default()
        }
    }
}

#[async_trait]
impl<T: Record> Backend<T> for KubeBackend<T> {
    async fn fetch(&self) -> ConfigResult<T> {
        let secret = self
            .api
            .get_opt(&self.secret_name)
            .await
            .map_err(|e| ConfigError::Fetch(e.to_string()))?;

        match secret {
            None => {
                *self.last_resource_version.lock().unwrap() = None;
                *self.secret_exists.lock().unwrap() = false;
                Ok(T::default())
            }
            Some(secret) => {
                *self.last_resource_version.lock().unwrap() =
                    secret.metadata.resource_version.clone();
                *self.secret_exists.lock().unwrap() = true;
                let bytes = secret
                    .data
                    .as_ref()
                    .and_then(|data| data.get(&self.data_key))
                    .map(|b| b.0.clone())
                    .unwrap_or_default();
                T::decode(&bytes)
            }
        }
    }

    async fn save(&self, record: &T) -> ConfigResult<()> {
        let bytes = record.encode()?;
        let exists = *self.secret_exists.lock().unwrap();
        let resource_version = self.last_resource_version.lock().unwrap().clone();

        let result = if exists {
            let secret = self.build_secret(bytes, resource_version);
            self.api
                .replace(&self.secret_name, &PostParams::default(), &secret)
                .await
        } else {
            let secret = self.build_secret(bytes, None);
            self.api.create(&PostParams::default(), &secret).await
        };

        match result {
            Ok(saved) => {
                *self.last_resource_version.lock().unwrap() = saved.metadata.resource_version;
                *self.secret_exists.lock().unwrap() = true;
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ConfigError::ConflictingUpdate),
            Err(e) => Err(ConfigError::Save(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_name_format() {
        assert_eq!(secret_name_for("prod-db-target"), "bctl-prod-db-target-secret");
    }
}
