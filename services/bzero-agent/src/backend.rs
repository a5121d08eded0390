//! Backend selection: host file or Kubernetes secret, chosen at startup.

use async_trait::async_trait;
use bzero_config::{Backend, ConfigResult, FileBackend, KubeBackend, Record};

/// Either durable backend behind one type, so the rest of the agent does
/// not go generic over the choice.
pub enum AnyBackend<T> {
    File(FileBackend<T>),
    Kube(KubeBackend<T>),
}

#[async_trait]
impl<T: Record> Backend<T> for AnyBackend<T> {
    async fn fetch(&self) -> ConfigResult<T> {
        match self {
            AnyBackend::File(backend) => backend.fetch().await,
            AnyBackend::Kube(backend) => backend.fetch().await,
        }
    }

    async fn save(&self, record: &T) -> ConfigResult<()> {
        match self {
            AnyBackend::File(backend) => backend.save(record).await,
            AnyBackend::Kube(backend) => backend.save(record).await,
        }
    }
}
