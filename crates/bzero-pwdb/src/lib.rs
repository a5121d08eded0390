//! BastionZero Pwdb - password-less database access
//!
//! The agent-side `db/pwdb` action authenticates to a PostgreSQL-wire
//! database without a long-lived secret reaching either the operator or the
//! agent. Three modes, selected by a prefix on the remote host:
//!
//! - `gcp://` — Cloud SQL IAM: an impersonated service-account token is
//!   delegated through the in-process brokering proxy as a cleartext
//!   password (inside TLS).
//! - `rds://` — RDS IAM: a SigV4-presigned auth token is injected into the
//!   server's SCRAM-SHA-256 or cleartext flow by the brokering proxy.
//! - bare host — split-certificate: the agent partially signs an ephemeral
//!   client certificate with its key share, the bastion co-signs, and the
//!   TLS client handshake authenticates with the result.

pub mod action;
pub mod protocol;
pub mod proxy;
pub mod scram;
pub mod splitcert;
pub mod tls;
pub mod token;

pub use action::{PwdbActionPayload, PwdbAgentAction};
pub use proxy::{BrokeringProxy, DelegatedAuth};
pub use scram::ScramClient;
pub use splitcert::{CertificateCoSigner, CoSignRequest};
pub use token::{StaticTokenProvider, TokenProvider};

use bzero_types::TunnelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PwdbError {
    #[error("i/o failure: {0}")]
    Io(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("scram failure: {0}")]
    Scram(String),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl PwdbError {
    pub(crate) fn io(e: std::io::Error) -> Self {
        PwdbError::Io(e.to_string())
    }
}

impl From<PwdbError> for TunnelError {
    fn from(e: PwdbError) -> Self {
        match e {
            PwdbError::Tunnel(inner) => inner,
            other => TunnelError::ConnectionFailed(other.to_string()),
        }
    }
}

pub type PwdbResult<T> = Result<T, PwdbError>;

/// How to reach and authenticate to the database, parsed from the remote
/// host field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    Gcp { host: String },
    Rds { host: String },
    SplitCert { host: String },
}

impl ConnectionMode {
    pub fn parse(target_host: &str) -> Self {
        if let Some(host) = target_host.strip_prefix("gcp://") {
            ConnectionMode::Gcp { host: host.to_string() }
        } else if let Some(host) = target_host.strip_prefix("rds://") {
            ConnectionMode::Rds { host: host.to_string() }
        } else {
            ConnectionMode::SplitCert { host: target_host.to_string() }
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ConnectionMode::Gcp { host }
            | ConnectionMode::Rds { host }
            | ConnectionMode::SplitCert { host } => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            ConnectionMode::parse("rds://mydb.us-east-1.rds.amazonaws.com"),
            ConnectionMode::Rds { host: "mydb.us-east-1.rds.amazonaws.com".into() }
        );
        assert_eq!(
            ConnectionMode::parse("gcp://project:region:instance"),
            ConnectionMode::Gcp { host: "project:region:instance".into() }
        );
        assert_eq!(
            ConnectionMode::parse("db.internal.example.com"),
            ConnectionMode::SplitCert { host: "db.internal.example.com".into() }
        );
    }
}
