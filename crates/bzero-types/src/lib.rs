//! BastionZero Wire Types - Canonical frames for the agent/daemon control plane
//!
//! This crate contains the foundational wire types with zero dependencies on
//! other bzero crates:
//!
//! - [`AgentMessage`] — the transport frame multiplexed over the websocket
//! - [`StreamMessage`] — the sequenced stream frame exchanged by plugin actions
//! - [`Action`] — parsed `<plugin>/<subaction>` identifiers
//! - The shared tunnel error taxonomy surfaced to operators
//!
//! Every structure here crosses a process boundary as JSON. Field names are
//! part of the protocol and must not change without a schema version bump.

pub mod action;
pub mod error;
pub mod message;
pub mod stream;

pub use action::*;
pub use error::*;
pub use message::*;
pub use stream::*;

/// Current schema version stamped on outgoing frames.
pub const SCHEMA_VERSION: &str = "2.1";

/// Legacy schema version. Peers on this version expect `DbStreamEnd` as the
/// terminal stream marker instead of `Stream` with `more=false`.
pub const LEGACY_SCHEMA_VERSION: &str = "1.0";

/// Returns true when the peer's advertised schema predates the `more` flag.
pub fn is_legacy_schema(version: &str) -> bool {
    version
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .map(|major| major < 2)
        .unwrap_or(true)
}
