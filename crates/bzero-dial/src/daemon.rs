//! Daemon half: pump a locally accepted connection.

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::pump;
use crate::subactions;

/// Daemon-side `db/dial`: owns one connection accepted by the local
/// listener and mirrors it onto the datachannel. The daemon service
/// constructs one of these per accept and opens a fresh channel for it.
pub struct DialDaemonAction {
    outbox: Outbox,
    tomb: Tomb,
    connection: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer_schema: String,
    action: String,
}

impl DialDaemonAction {
    pub fn new(connection: TcpStream, peer_schema: &str) -> Self {
        Self::for_action(connection, peer_schema, actions::DB_DIAL)
    }

    /// The same byte pump serves `db/pwdb` channels; only the action name
    /// on the frames differs.
    pub fn for_action(connection: TcpStream, peer_schema: &str, action: &str) -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            connection: Mutex::new(Some(connection)),
            writer: Mutex::new(None),
            peer_schema: peer_schema.to_string(),
            action: action.to_string(),
        }
    }
}

#[async_trait]
impl PluginAction for DialDaemonAction {
    fn action_name(&self) -> &str {
        &self.action
    }

    async fn start_action(&self, _payload: &[u8]) -> Result<(), TunnelError> {
        let stream = self
            .connection
            .lock()
            .await
            .take()
            .ok_or_else(|| TunnelError::Internal("dial daemon action started twice".into()))?;
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        let peer_schema = self.peer_schema.clone();
        let action = self.action.clone();
        tokio::spawn(async move {
            pump::pump_reads(reader, outbox, tomb, &action, &peer_schema).await;
        });
        Ok(())
    }

    async fn receive(&self, subaction: &str, _payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::STOP => {
                self.kill("stopped by peer").await;
                Ok(Vec::new())
            }
            other => Err(TunnelError::Internal(format!(
                "unhandled dial subaction '{}'",
                other
            ))),
        }
    }

    async fn receive_stream(&self, msg: StreamMessage) {
        let Ok(content) = msg.decode_content() else {
            tracing::warn!("undecodable dial stream content");
            return;
        };
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return;
        };
        if !content.is_empty() && !pump::write_chunk(writer, &content).await {
            self.tomb.kill(Some("local write failed".into()));
            self.tomb.mark_dead();
            return;
        }
        if !msg.more || msg.stream_type == StreamType::DbStreamEnd {
            pump::shutdown_write(writer).await;
            // the remote half is done; our reader notices local EOF on its own
        }
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.connection.lock().await.take();
        self.writer.lock().await.take();
        self.tomb.kill(if reason.is_empty() {
            None
        } else {
            Some(reason.to_string())
        });
        self.tomb.mark_dead();
    }

    fn tomb(&self) -> &Tomb {
        &self.tomb
    }
}
