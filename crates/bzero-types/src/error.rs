//! Shared error taxonomy for tunneled sessions.
//!
//! These are the errors that cross the plugin boundary and reach operators;
//! the display strings are part of the user contract.

use thiserror::Error;

/// Errors internal to this crate's parsers.
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("malformed action identifier '{0}'")]
    MalformedAction(String),
}

/// Session-fatal errors surfaced to the daemon and ultimately the operator.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("failed to establish connection: {0}")]
    ConnectionFailed(String),

    #[error("the database server did not accept the SSL request; enable SSL on the server")]
    TlsDisabled,

    #[error("no key shard is provisioned for target {0}; provision one before connecting")]
    PwdbMissingKey(String),

    #[error("bastion failed to cosign client certificate: {0}")]
    ClientCertCosign(String),

    #[error("certificate signed by unknown authority")]
    PwdbUnknownAuthority,

    #[error("server certificate has expired")]
    ServerCertificateExpired,

    #[error("server certificate is not valid for the requested server name")]
    IncorrectServerName,

    #[error("shell session quit")]
    ShellQuit,

    #[error("shell session cancelled")]
    ShellCancelled,

    #[error("ssh stdin closed")]
    SshStdinClosed,

    #[error("keysplitting verification failed: {0}")]
    HandshakeVerification(String),

    #[error("{0}")]
    Internal(String),
}

impl TunnelError {
    /// Errors that parent processes treat as a clean exit.
    pub fn is_clean_exit(&self) -> bool {
        matches!(
            self,
            TunnelError::ShellQuit | TunnelError::ShellCancelled | TunnelError::SshStdinClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_messages() {
        assert_eq!(TunnelError::ConnectionRefused.to_string(), "connection refused");
        assert!(TunnelError::ConnectionFailed("dial timeout".into())
            .to_string()
            .starts_with("failed to establish connection"));
        assert_eq!(
            TunnelError::PwdbUnknownAuthority.to_string(),
            "certificate signed by unknown authority"
        );
    }

    #[test]
    fn test_clean_exit_classification() {
        assert!(TunnelError::ShellQuit.is_clean_exit());
        assert!(TunnelError::SshStdinClosed.is_clean_exit());
        assert!(!TunnelError::ConnectionRefused.is_clean_exit());
    }
}
