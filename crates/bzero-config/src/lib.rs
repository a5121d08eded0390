//! BastionZero Durable Config - concurrency-safe agent state
//!
//! Two stores share one discipline:
//!
//! - [`ConfigStore`] — the typed agent configuration record
//!   ([`AgentData`]), loaded once at startup, mutated fetch-modify-save
//!   under an exclusive lock.
//! - [`KeyShardStore`] — the split-key material mapped to target
//!   identifiers, with the same locking discipline.
//!
//! Both are generic over a [`Backend`]: a host file written atomically under
//! an advisory lock, or a Kubernetes secret guarded by optimistic
//! concurrency on `resourceVersion`.

pub mod backend;
pub mod data;
pub mod error;
pub mod file;
pub mod keyshard;
pub mod kube;
pub mod store;

pub use backend::{Backend, Record};
pub use data::{AgentData, AgentType, RegistrationData};
pub use error::{ConfigError, ConfigResult};
pub use file::FileBackend;
pub use keyshard::{KeyShardData, KeyShardStore, MappedKeyEntry, ShardKeyPair};
pub use kube::KubeBackend;
pub use store::ConfigStore;
