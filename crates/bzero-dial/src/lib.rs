//! BastionZero Dial - the straight TCP tunnel
//!
//! The simplest plugin pair: the daemon half pumps bytes between a locally
//! accepted connection and the datachannel; the agent half dials the remote
//! `host:port` and pumps the other side. Bytes travel as sequenced `Stream`
//! frames in 64 KiB chunks; EOF from either socket becomes the terminal
//! frame for that half.

mod pump;

pub mod agent;
pub mod daemon;

pub use agent::DialAgentAction;
pub use daemon::DialDaemonAction;

use serde::{Deserialize, Serialize};

/// Subactions under `db/dial`. The start leg rides the Syn payload and
/// data rides sequenced stream frames, so only the close handshake needs a
/// named command.
pub mod subactions {
    pub const STOP: &str = "dial/stop";
}

/// Syn payload of a `db/dial` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialActionPayload {
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
    /// Peer schema version; pre-2.0 peers expect `DbStreamEnd` terminals.
    #[serde(rename = "schemaVersion", default = "default_schema")]
    pub schema_version: String,
}

fn default_schema() -> String {
    bzero_types::SCHEMA_VERSION.to_string()
}

impl DialActionPayload {
    pub fn new(target_host: &str, target_port: u16) -> Self {
        Self {
            target_host: target_host.to_string(),
            target_port,
            schema_version: default_schema(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}
