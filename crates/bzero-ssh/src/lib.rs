//! BastionZero SSH - opaque and transparent SSH tunneling
//!
//! Two very different actions share this crate:
//!
//! - **Opaque** (`ssh/opaque`): the operator's own ssh client speaks through
//!   the tunnel to the target's sshd. The agent installs a short-lived
//!   `authorized_keys` entry for the session and dials `localhost:22`; the
//!   daemon just shuttles stdio.
//! - **Transparent** (`ssh/transparent`): the daemon terminates the SSH
//!   protocol itself — accepting only whitelisted scp/sftp/git requests —
//!   and the agent runs the approved command as the target user.

pub mod authorized_keys;
pub mod exec;
pub mod known_hosts;
pub mod opaque;
pub mod transparent;
pub mod whitelist;

pub use authorized_keys::AuthorizedKeys;
pub use exec::{ExecPayload, TransparentOpenPayload, TransparentSshAgentAction};
pub use known_hosts::KnownHosts;
pub use opaque::{OpaqueSshAgentAction, OpaqueSshDaemonAction, SshOpenPayload};
pub use transparent::TransparentSshDaemon;
pub use whitelist::{validate_command, ApprovedCommand};

use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

/// Subactions under `ssh/*`.
pub mod subactions {
    pub const OPEN: &str = "ssh/open";
    pub const INPUT: &str = "ssh/input";
    pub const EXEC: &str = "ssh/exec";
    pub const CLOSE: &str = "ssh/close";
}

/// Unix usernames we are willing to touch files for.
pub fn validate_target_user(user: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("pattern compiles"))
        .is_match(user)
}

/// Public key material must be valid base64 before it goes anywhere near
/// an authorized_keys file.
pub fn validate_public_key(key_base64: &str) -> bool {
    !key_base64.is_empty()
        && base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .is_ok()
}
