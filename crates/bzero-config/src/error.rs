//! Config-layer error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The backend failed to produce a record.
    #[error("failed to fetch config: {0}")]
    Fetch(String),

    /// The backend failed to persist, possibly after partial success.
    #[error("failed to save config: {0}")]
    Save(String),

    /// Another writer changed the record between our fetch and save.
    #[error("config changed since last fetch")]
    ConflictingUpdate,

    /// The requested mutation would not change stored state. Returned
    /// instead of saving; callers treat it as idempotent success.
    #[error("mutation is a no-op")]
    NoOp,

    /// Key-shard store: the supplied key material is unusable.
    #[error("invalid key shard: {0}")]
    Key(String),

    /// Key-shard store: no entry covers the given target.
    #[error("no key shard found for target {0}")]
    Target(String),

    /// A setter refused malformed input.
    #[error("invalid JWKS URL '{0}'")]
    InvalidJwksUrl(String),

    #[error("failed to decode stored config: {0}")]
    Decode(String),

    #[error("failed to encode config: {0}")]
    Encode(String),
}

impl ConfigError {
    /// True for results that leave stored state exactly as it was.
    pub fn is_noop(&self) -> bool {
        matches!(self, ConfigError::NoOp)
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
