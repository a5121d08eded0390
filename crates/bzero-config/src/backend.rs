//! Storage backend contract shared by the config and key-shard stores.

use async_trait::async_trait;

use crate::error::ConfigResult;

/// A record type that can live in a backend.
///
/// `decode` must accept every historical serialization of the record,
/// including the empty sentinel meaning "uninitialized".
pub trait Record: Clone + Default + Send + Sync + 'static {
    fn decode(bytes: &[u8]) -> ConfigResult<Self>;
    fn encode(&self) -> ConfigResult<Vec<u8>>;
}

/// A place records are fetched from and saved to.
///
/// Implementations are responsible for cross-process safety: the host-file
/// backend holds an advisory file lock, the Kubernetes backend relies on
/// `resourceVersion` optimistic concurrency.
#[async_trait]
pub trait Backend<T: Record>: Send + Sync {
    async fn fetch(&self) -> ConfigResult<T>;
    async fn save(&self, record: &T) -> ConfigResult<()>;
}

/// Fetch with a single retry before surfacing the failure.
pub(crate) async fn fetch_with_retry<T: Record, B: Backend<T> + ?Sized>(backend: &B) -> ConfigResult<T> {
    match backend.fetch().await {
        Ok(record) => Ok(record),
        Err(first) => {
            tracing::warn!(error = %first, "config fetch failed, retrying once");
            backend.fetch().await
        }
    }
}

/// Save with a single retry before surfacing the failure.
pub(crate) async fn save_with_retry<T: Record, B: Backend<T> + ?Sized>(
    backend: &B,
    record: &T,
) -> ConfigResult<()> {
    match backend.save(record).await {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(error = %first, "config save failed, retrying once");
            backend.save(record).await
        }
    }
}
