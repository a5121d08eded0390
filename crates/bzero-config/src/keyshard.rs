//! The key-shard store: split-key material mapped to target identifiers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{fetch_with_retry, save_with_retry, Backend, Record};
use crate::error::{ConfigError, ConfigResult};

/// The PEM pair a shard entry carries: the split private-key share and the
/// CA certificate it partially signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPair {
    #[serde(rename = "KeyShardPem")]
    pub key_shard_pem: String,
    #[serde(rename = "CaCertPem")]
    pub ca_cert_pem: String,
}

/// One stored entry: key material plus the targets allowed to use it.
///
/// `target_ids` has set semantics but is stored as an array to keep the
/// serialized form stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedKeyEntry {
    #[serde(rename = "KeyData")]
    pub key: ShardKeyPair,
    #[serde(rename = "TargetIds")]
    pub target_ids: Vec<String>,
}

impl MappedKeyEntry {
    fn contains_target(&self, target_id: &str) -> bool {
        self.target_ids.iter().any(|t| t == target_id)
    }
}

/// The whole store: insertion-ordered, newest entries at the highest index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyShardData {
    #[serde(rename = "Keys", default)]
    pub keys: Vec<MappedKeyEntry>,
}

impl Record for KeyShardData {
    fn decode(bytes: &[u8]) -> ConfigResult<Self> {
        if bytes.is_empty() {
            return Ok(KeyShardData::default());
        }
        serde_json::from_slice(bytes).map_err(|e| ConfigError::Decode(e.to_string()))
    }

    fn encode(&self) -> ConfigResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConfigError::Encode(e.to_string()))
    }
}

/// Concurrency-safe operations over [`KeyShardData`], with the same
/// fetch-modify-save discipline as the config store.
pub struct KeyShardStore<B> {
    backend: Arc<B>,
    cache: RwLock<KeyShardData>,
    write_lock: Mutex<()>,
}

impl<B: Backend<KeyShardData>> KeyShardStore<B> {
    pub async fn load(backend: B) -> ConfigResult<Self> {
        let backend = Arc::new(backend);
        let data = fetch_with_retry(backend.as_ref()).await?;
        Ok(Self {
            backend,
            cache: RwLock::new(data),
            write_lock: Mutex::new(()),
        })
    }

    pub async fn reload(&self) -> ConfigResult<()> {
        let fresh = fetch_with_retry(self.backend.as_ref()).await?;
        *self.cache.write().await = fresh;
        Ok(())
    }

    /// Add an entry. Entries are identified by their `key_shard_pem` bytes:
    /// adding an existing shard merges the new target ids into the existing
    /// entry, and merging nothing new is a no-op.
    pub async fn add_key(&self, entry: MappedKeyEntry) -> ConfigResult<()> {
        if entry.key.key_shard_pem.is_empty() {
            return Err(ConfigError::Key("empty key shard PEM".into()));
        }
        self.mutate(|data| {
            match data
                .keys
                .iter_mut()
                .find(|existing| existing.key.key_shard_pem == entry.key.key_shard_pem)
            {
                Some(existing) => {
                    let mut changed = false;
                    for target in &entry.target_ids {
                        if !existing.contains_target(target) {
                            existing.target_ids.push(target.clone());
                            changed = true;
                        }
                    }
                    if changed {
                        Ok(())
                    } else {
                        Err(ConfigError::NoOp)
                    }
                }
                None => {
                    data.keys.push(entry);
                    Ok(())
                }
            }
        })
        .await
    }

    /// Ensure `target_id` appears in every entry's target set.
    pub async fn add_target(&self, target_id: &str) -> ConfigResult<()> {
        self.mutate(|data| {
            let mut changed = false;
            for entry in &mut data.keys {
                if !entry.contains_target(target_id) {
                    entry.target_ids.push(target_id.to_string());
                    changed = true;
                }
            }
            if changed {
                Ok(())
            } else {
                Err(ConfigError::NoOp)
            }
        })
        .await
    }

    /// The key data of the newest entry covering `target_id`.
    pub async fn last_key(&self, target_id: &str) -> ConfigResult<ShardKeyPair> {
        let data = self.cache.read().await;
        data.keys
            .iter()
            .rev()
            .find(|entry| entry.contains_target(target_id))
            .map(|entry| entry.key.clone())
            .ok_or_else(|| ConfigError::Target(target_id.to_string()))
    }

    /// Remove `target_id` from the newest entry containing it
    /// (`hard == false`), or from every entry (`hard == true`).
    pub async fn delete_target(&self, target_id: &str, hard: bool) -> ConfigResult<()> {
        self.mutate(|data| {
            if hard {
                let mut found = false;
                for entry in &mut data.keys {
                    let before = entry.target_ids.len();
                    entry.target_ids.retain(|t| t != target_id);
                    found |= entry.target_ids.len() != before;
                }
                if found {
                    Ok(())
                } else {
                    Err(ConfigError::Target(target_id.to_string()))
                }
            } else {
                match data
                    .keys
                    .iter_mut()
                    .rev()
                    .find(|entry| entry.contains_target(target_id))
                {
                    Some(entry) => {
                        entry.target_ids.retain(|t| t != target_id);
                        Ok(())
                    }
                    None => Err(ConfigError::Target(target_id.to_string())),
                }
            }
        })
        .await
    }

    /// Reset the store to empty.
    pub async fn clear(&self) -> ConfigResult<()> {
        self.mutate(|data| {
            if data.keys.is_empty() {
                return Err(ConfigError::NoOp);
            }
            data.keys.clear();
            Ok(())
        })
        .await
    }

    /// Serialized form of the whole store, for export.
    pub async fn to_json(&self) -> ConfigResult<String> {
        let data = self.cache.read().await;
        serde_json::to_string(&*data).map_err(|e| ConfigError::Encode(e.to_string()))
    }

    async fn mutate<F>(&self, apply: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut KeyShardData) -> ConfigResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut fresh = fetch_with_retry(self.backend.as_ref()).await?;
        apply(&mut fresh)?;
        save_with_retry(self.backend.as_ref(), &fresh).await?;
        *self.cache.write().await = fresh;
        Ok(())
    }
}
