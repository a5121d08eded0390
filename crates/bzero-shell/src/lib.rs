//! BastionZero Shell - reattachable PTY tunnel
//!
//! The agent allocates a PTY, runs the user's shell on the slave side, and
//! pumps the master. Output is mirrored into a bounded replay buffer so a
//! daemon that attaches later (same `dataChannelId`) sees recent history
//! before the live stream resumes.

pub mod action;
pub mod replay;

pub use action::{ShellAgentAction, ShellOpenPayload};
pub use replay::ReplayBuffer;

/// Subactions under `shell/default`.
pub mod subactions {
    pub const OPEN: &str = "shell/open";
    pub const INPUT: &str = "shell/input";
    pub const RESIZE: &str = "shell/resize";
    pub const ATTACH: &str = "shell/attach";
    pub const CLOSE: &str = "shell/close";
}
