//! The uniform plugin action contract.

use async_trait::async_trait;
use bzero_types::{StreamMessage, TunnelError};
use tokio::sync::{mpsc, Mutex};

use crate::tomb::Tomb;

/// What a plugin hands to the datachannel for sending.
#[derive(Debug)]
pub enum PluginMessage {
    /// Sequenced stream traffic. The datachannel assigns the outgoing
    /// sequence number; whatever the plugin put there is overwritten.
    Stream(StreamMessage),
    /// A keysplitting-verified command to the peer plugin half.
    Command { subaction: String, payload: Vec<u8> },
}

/// One protocol implementation (Dial, Pwdb, Ssh/*, Shell, Kube/*), either
/// half. The datachannel drives it; the plugin never touches the transport.
#[async_trait]
pub trait PluginAction: Send + Sync {
    /// The `<plugin>/<subaction>` this instance serves.
    fn action_name(&self) -> &str;

    /// Stand up action-specific state. May open external resources (TCP
    /// socket, PTY, local listener). `payload` is the Syn payload.
    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError>;

    /// Handle a verified command from the peer; the returned bytes travel
    /// back on the ack leg.
    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError>;

    /// Handle one in-order stream frame from the peer.
    async fn receive_stream(&self, msg: StreamMessage);

    /// Take the plugin's outbox. The datachannel calls this exactly once.
    async fn take_outbox(&self) -> Option<mpsc::Receiver<PluginMessage>>;

    /// Stop now: close external sockets, cancel tasks, surface `reason`.
    async fn kill(&self, reason: &str);

    /// The plugin's lifecycle latch; `dead` + `err` answer Done()/Err().
    fn tomb(&self) -> &Tomb;
}

/// The sending half plugins embed: a bounded queue plus the receiver the
/// datachannel takes at startup.
pub struct Outbox {
    tx: mpsc::Sender<PluginMessage>,
    rx: Mutex<Option<mpsc::Receiver<PluginMessage>>>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<PluginMessage> {
        self.tx.clone()
    }

    pub async fn send(&self, msg: PluginMessage) -> Result<(), TunnelError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TunnelError::Internal("plugin outbox closed".into()))
    }

    pub async fn take(&self) -> Option<mpsc::Receiver<PluginMessage>> {
        self.rx.lock().await.take()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzero_types::StreamType;

    #[tokio::test]
    async fn test_outbox_taken_once() {
        let outbox = Outbox::default();
        assert!(outbox.take().await.is_some());
        assert!(outbox.take().await.is_none());
    }

    #[tokio::test]
    async fn test_outbox_delivery() {
        let outbox = Outbox::default();
        let mut rx = outbox.take().await.unwrap();
        outbox
            .send(PluginMessage::Stream(StreamMessage::new(
                "db/dial",
                StreamType::Stream,
                0,
                b"hello",
            )))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(PluginMessage::Stream(_))));
    }
}
