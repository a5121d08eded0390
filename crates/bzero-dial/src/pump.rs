//! Shared byte pumps between a TCP stream and a plugin outbox.

use std::time::Duration;

use bzero_datachannel::PluginMessage;
use bzero_datachannel::Tomb;
use bzero_types::{is_legacy_schema, StreamMessage, StreamType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

/// Forwarding chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Bound on a single write toward the local/remote socket.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Read the socket until EOF or death, emitting sequenced `Stream` frames.
/// EOF produces the terminal frame for this half (`Stream` with
/// `more=false`, or `DbStreamEnd` for legacy peers) and marks the tomb;
/// read failures kill the tomb with the error.
pub async fn pump_reads(
    mut reader: OwnedReadHalf,
    outbox: mpsc::Sender<PluginMessage>,
    tomb: Tomb,
    action: &str,
    peer_schema: &str,
) {
    let legacy = is_legacy_schema(peer_schema);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = tomb.dying() => return,
        };
        match read {
            Ok(0) => {
                let terminal = if legacy {
                    StreamMessage::new(action, StreamType::DbStreamEnd, 0, &[])
                } else {
                    StreamMessage::terminal(action, StreamType::Stream, 0)
                };
                let _ = outbox.send(PluginMessage::Stream(terminal)).await;
                tomb.kill(None);
                tomb.mark_dead();
                return;
            }
            Ok(n) => {
                let frame = StreamMessage::new(action, StreamType::Stream, 0, &buf[..n]);
                if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tomb.kill(Some(format!("socket read failed: {}", e)));
                tomb.mark_dead();
                return;
            }
        }
    }
}

/// Write one inbound chunk to the socket under the write deadline.
/// Returns false when the write failed and the session should die.
pub async fn write_chunk(writer: &mut OwnedWriteHalf, chunk: &[u8]) -> bool {
    matches!(
        tokio::time::timeout(WRITE_DEADLINE, writer.write_all(chunk)).await,
        Ok(Ok(()))
    )
}

/// Half-close after the peer's terminal frame.
pub async fn shutdown_write(writer: &mut OwnedWriteHalf) {
    let _ = writer.shutdown().await;
}
