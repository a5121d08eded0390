//! Agent half: dial out and pump.

use std::time::Duration;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::pump;
use crate::{subactions, DialActionPayload};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent-side `db/dial`: connects to the requested `host:port` and shuttles
/// bytes between the remote socket and the datachannel.
pub struct DialAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl DialAgentAction {
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            writer: Mutex::new(None),
        }
    }
}

impl Default for DialAgentAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAction for DialAgentAction {
    fn action_name(&self) -> &str {
        actions::DB_DIAL
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let params: DialActionPayload = serde_json::from_slice(payload)
            .map_err(|e| TunnelError::Internal(format!("bad dial payload: {}", e)))?;

        let connect = TcpStream::connect(params.address());
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(TunnelError::ConnectionRefused);
            }
            Ok(Err(e)) => return Err(TunnelError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(TunnelError::ConnectionFailed("dial timed out".into())),
        };

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        let peer_schema = params.schema_version;
        tokio::spawn(async move {
            pump::pump_reads(reader, outbox, tomb, actions::DB_DIAL, &peer_schema).await;
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
            self.tomb.kill(Some("remote write failed".into()));
            self.tomb.mark_dead();
            return;
        }
        if !msg.more || msg.stream_type == StreamType::DbStreamEnd {
            pump::shutdown_write(writer).await;
        }
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        // dropping the write half closes the socket
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn start_pong_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong\n").await.unwrap();
            // remote closes: the agent must emit the terminal frame
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_roundtrip_and_terminal_on_remote_close() {
        let addr = start_pong_server().await;
        let action = DialAgentAction::new();
        let payload =
            serde_json::to_vec(&DialActionPayload::new(&addr.ip().to_string(), addr.port()))
                .unwrap();
        action.start_action(&payload).await.unwrap();
        let mut outbox = action.take_outbox().await.unwrap();

        action
            .receive_stream(StreamMessage::new(
                actions::DB_DIAL,
                StreamType::Stream,
                0,
                b"ping",
            ))
            .await;

        let first = outbox.recv().await.unwrap();
        match first {
            PluginMessage::Stream(msg) => {
                assert_eq!(msg.decode_content().unwrap(), b"pong\n");
                assert!(msg.more);
            }
            other => panic!("unexpected outbox message {:?}", other),
        }

        let second = outbox.recv().await.unwrap();
        match second {
            PluginMessage::Stream(msg) => assert!(!msg.more),
            other => panic!("unexpected outbox message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_surfaces_typed_error() {
        // bind-then-drop guarantees an unused port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let action = DialAgentAction::new();
        let payload =
            serde_json::to_vec(&DialActionPayload::new(&addr.ip().to_string(), addr.port()))
                .unwrap();
        let err = action.start_action(&payload).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_legacy_peer_gets_db_stream_end() {
        let addr = start_pong_server().await;
        let action = DialAgentAction::new();
        let mut params = DialActionPayload::new(&addr.ip().to_string(), addr.port());
        params.schema_version = bzero_types::LEGACY_SCHEMA_VERSION.to_string();
        action
            .start_action(&serde_json::to_vec(&params).unwrap())
            .await
            .unwrap();
        let mut outbox = action.take_outbox().await.unwrap();

        action
            .receive_stream(StreamMessage::new(
                actions::DB_DIAL,
                StreamType::Stream,
                0,
                b"ping",
            ))
            .await;

        let _pong = outbox.recv().await.unwrap();
        match outbox.recv().await.unwrap() {
            PluginMessage::Stream(msg) => {
                assert_eq!(msg.stream_type, StreamType::DbStreamEnd);
            }
            other => panic!("unexpected outbox message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_subaction_kills() {
        let addr = start_pong_server().await;
        let action = DialAgentAction::new();
        let payload =
            serde_json::to_vec(&DialActionPayload::new(&addr.ip().to_string(), addr.port()))
                .unwrap();
        action.start_action(&payload).await.unwrap();
        action.receive(subactions::STOP, &[]).await.unwrap();
        assert!(!action.tomb().is_alive());
    }
}
