//! BastionZero Transport - the shared signaling channel
//!
//! One websocket per process role, carrying signalR-framed JSON invocations.
//! Inbound frames are demultiplexed by channel id through the
//! [`Broker`]; outbound frames flow through a bounded queue drained by a
//! single send pump. Ungraceful disconnects reconnect under capped
//! exponential backoff while the outbound queue is preserved.

pub mod backoff;
pub mod broker;
pub mod frame;
pub mod websocket;

pub use backoff::Backoff;
pub use broker::{Broker, Subscriber};
pub use frame::{Frame, RECORD_SEPARATOR};
pub use websocket::{Role, TargetSelector, Websocket, WebsocketConfig};

use async_trait::async_trait;
use bzero_types::AgentMessage;
use thiserror::Error;

/// The one capability a datachannel needs from the transport. Holding this
/// instead of the transport itself keeps ownership one-way: the transport
/// owns the broker, and channels reach back only through a send method.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, msg: AgentMessage) -> TransportResult<()>;
}

#[async_trait]
impl MessageSender for Websocket {
    async fn send_message(&self, msg: AgentMessage) -> TransportResult<()> {
        self.send(msg).await
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("connect retry budget exhausted: {0}")]
    RetryBudgetExhausted(String),

    #[error("transport is closed: {0}")]
    Closed(String),

    #[error("no subscriber for channel {0}")]
    UnknownChannel(String),

    #[error("timed out waiting for AgentConnected")]
    AgentConnectedTimeout,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("outbound queue send failed")]
    SendFailed,
}

pub type TransportResult<T> = Result<T, TransportError>;
