//! BastionZero Datachannel - one tunneled session over the shared transport
//!
//! A datachannel is a logical, ordered, bidirectional byte pipe identified
//! by a channel id. It owns exactly one [`PluginAction`] on each side and
//! shuttles two kinds of traffic between the halves:
//!
//! - keysplitting-verified command payloads (`Data`/`DataAck`), opaque to
//!   this crate and checked through the [`Handshaker`] seam;
//! - sequenced [`StreamMessage`]s, delivered to the plugin strictly in
//!   order by the reorder buffer.
//!
//! Lifecycle is cooperative: every task group hangs off a [`Tomb`], and
//! killing the channel cancels the plugin, its sockets, and its pumps.

pub mod channel;
pub mod handshake;
pub mod ordering;
pub mod plugin;
pub mod tomb;

pub use channel::DataChannel;
pub use handshake::{Handshaker, HandshakeKind, NoopHandshaker};
pub use ordering::OrderedBuffer;
pub use plugin::{Outbox, PluginAction, PluginMessage};
pub use tomb::Tomb;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(#[from] bzero_transport::TransportError),

    #[error("keysplitting verification failed: {0}")]
    Verification(String),

    #[error("plugin failed: {0}")]
    Plugin(String),

    #[error("channel closed: {0}")]
    Closed(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;
