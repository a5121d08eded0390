//! Opaque SSH: the operator's ssh client rides the tunnel untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::authorized_keys::{AuthorizedKeys, KEY_LIFETIME_SECS};
use crate::{subactions, validate_public_key, validate_target_user};

const CHUNK_SIZE: usize = 64 * 1024;

/// Syn payload of an `ssh/opaque` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshOpenPayload {
    #[serde(rename = "targetUser")]
    pub target_user: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "keyType", default = "default_key_type")]
    pub key_type: String,
    #[serde(rename = "sshPort", default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_key_type() -> String {
    "ssh-rsa".into()
}

fn default_ssh_port() -> u16 {
    22
}

/// Agent-side `ssh/opaque`: install the session key, dial the local sshd,
/// shuttle bytes. The key is removed on close and swept after its 30 s
/// lifetime regardless.
pub struct OpaqueSshAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Override for containers and tests; defaults to the target user's
    /// `~/.ssh/authorized_keys`.
    authorized_keys: Mutex<Option<Arc<AuthorizedKeys>>>,
    installed_line: Mutex<Option<(Arc<AuthorizedKeys>, String)>>,
}

impl OpaqueSshAgentAction {
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            writer: Mutex::new(None),
            authorized_keys: Mutex::new(None),
            installed_line: Mutex::new(None),
        }
    }

    pub async fn with_authorized_keys(self, keys: AuthorizedKeys) -> Self {
        *self.authorized_keys.lock().await = Some(Arc::new(keys));
        self
    }

    async fn remove_installed_key(&self) {
        if let Some((keys, line)) = self.installed_line.lock().await.take() {
            if let Err(e) = keys.remove(&line).await {
                tracing::warn!(error = %e, "failed to remove session key");
            }
        }
    }
}

impl Default for OpaqueSshAgentAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAction for OpaqueSshAgentAction {
    fn action_name(&self) -> &str {
        actions::SSH_OPAQUE
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let params: SshOpenPayload = serde_json::from_slice(payload)
            .map_err(|e| TunnelError::Internal(format!("bad ssh open payload: {}", e)))?;

        if !validate_target_user(&params.target_user) {
            return Err(TunnelError::Internal(format!(
                "invalid target user '{}'",
                params.target_user
            )));
        }
        if !validate_public_key(&params.public_key) {
            return Err(TunnelError::Internal("invalid public key encoding".into()));
        }

        let keys = match self.authorized_keys.lock().await.clone() {
            Some(keys) => keys,
            None => Arc::new(AuthorizedKeys::for_user(&params.target_user)),
        };
        let line = keys.install(&params.key_type, &params.public_key).await?;
        *self.installed_line.lock().await = Some((Arc::clone(&keys), line));

        // the key dies on schedule even if the session outlives it
        let sweeper_keys = Arc::clone(&keys);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(KEY_LIFETIME_SECS as u64 + 1)).await;
            let _ = sweeper_keys.sweep().await;
        });

        let stream = TcpStream::connect(("127.0.0.1", params.ssh_port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TunnelError::ConnectionRefused,
                _ => TunnelError::ConnectionFailed(e.to_string()),
            })?;
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let read = tokio::select! {
                    read = reader.read(&mut buf) => read,
                    _ = tomb.dying() => return,
                };
                match read {
                    Ok(0) => {
                        let terminal =
                            StreamMessage::terminal(actions::SSH_OPAQUE, StreamType::StdOut, 0);
                        let _ = outbox.send(PluginMessage::Stream(terminal)).await;
                        tomb.kill(None);
                        tomb.mark_dead();
                        return;
                    }
                    Ok(n) => {
                        let frame = StreamMessage::new(
                            actions::SSH_OPAQUE,
                            StreamType::StdOut,
                            0,
                            &buf[..n],
                        );
                        if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tomb.kill(Some(format!("sshd read failed: {}", e)));
                        tomb.mark_dead();
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::INPUT => {
                let mut writer = self.writer.lock().await;
                let writer = writer
                    .as_mut()
                    .ok_or_else(|| TunnelError::Internal("session not started".into()))?;
                writer
                    .write_all(payload)
                    .await
                    .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
                Ok(Vec::new())
            }
            subactions::CLOSE => {
                self.kill("closed by daemon").await;
                Ok(Vec::new())
            }
            other => Err(TunnelError::Internal(format!(
                "unhandled ssh subaction '{}'",
                other
            ))),
        }
    }

    async fn receive_stream(&self, _msg: StreamMessage) {
        // opaque input arrives as ssh/input commands, never as streams
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.remove_installed_key().await;
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

/// Daemon-side `ssh/opaque`: stdio plumbing. Bytes read from the ZLI's
/// stdin go out as raw `ssh/input` commands; `StdOut` frames from the
/// agent land on stdout. A closed stdin is a clean exit.
pub struct OpaqueSshDaemonAction {
    outbox: Outbox,
    tomb: Tomb,
    output: Mutex<Option<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>>,
}

impl OpaqueSshDaemonAction {
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            output: Mutex::new(None),
        }
    }

    /// Hand out a sender onto this action's outbox, for callers that need
    /// to enqueue their own commands alongside the stdio pump.
    pub fn outbox_sender(&self) -> tokio::sync::mpsc::Sender<PluginMessage> {
        self.outbox.sender()
    }

    /// Wire the controlling stdio pair. `input` is pumped until EOF.
    pub async fn wire_stdio(
        &self,
        mut input: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        output: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) {
        *self.output.lock().await = Some(Box::new(output));

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let read = tokio::select! {
                    read = input.read(&mut buf) => read,
                    _ = tomb.dying() => return,
                };
                match read {
                    Ok(0) | Err(_) => {
                        // stdin closed: treated as exit 0 by the parent
                        tomb.kill(None);
                        tomb.mark_dead();
                        return;
                    }
                    Ok(n) => {
                        let command = PluginMessage::Command {
                            subaction: subactions::INPUT.into(),
                            payload: buf[..n].to_vec(),
                        };
                        if outbox.send(command).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

impl Default for OpaqueSshDaemonAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAction for OpaqueSshDaemonAction {
    fn action_name(&self) -> &str {
        actions::SSH_OPAQUE
    }

    async fn start_action(&self, _payload: &[u8]) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn receive(&self, _subaction: &str, _payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        Ok(Vec::new())
    }

    async fn receive_stream(&self, msg: StreamMessage) {
        let Ok(content) = msg.decode_content() else {
            return;
        };
        let mut output = self.output.lock().await;
        if let Some(output) = output.as_mut() {
            if !content.is_empty() {
                let _ = output.write_all(&content).await;
                let _ = output.flush().await;
            }
        }
        if !msg.more {
            self.tomb.kill(None);
            self.tomb.mark_dead();
        }
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.output.lock().await.take();
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
    use tokio::net::TcpListener;

    async fn fake_sshd() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            let mut received = vec![0u8; 5];
            stream.read_exact(&mut received).await.unwrap();
            received
        });
        (addr, handle)
    }

    fn open_payload(port: u16) -> Vec<u8> {
        serde_json::to_vec(&SshOpenPayload {
            target_user: "alice".into(),
            public_key: "AAAAB3NzaC1yc2E=".into(),
            key_type: "ssh-rsa".into(),
            ssh_port: port,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_installs_key_and_tunnels_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("authorized_keys");
        let (addr, sshd) = fake_sshd().await;

        let action = OpaqueSshAgentAction::new()
            .with_authorized_keys(AuthorizedKeys::at_path(&keys_path))
            .await;
        action.start_action(&open_payload(addr.port())).await.unwrap();

        let contents = std::fs::read_to_string(&keys_path).unwrap();
        assert!(contents.contains("bzero-temp-key"));

        // banner comes back as a StdOut stream frame
        let mut outbox = action.take_outbox().await.unwrap();
        match outbox.recv().await.unwrap() {
            PluginMessage::Stream(msg) => {
                assert_eq!(msg.stream_type, StreamType::StdOut);
                assert!(msg.decode_content().unwrap().starts_with(b"SSH-2.0"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        // raw input flows to the sshd
        action.receive(subactions::INPUT, b"hello").await.unwrap();
        assert_eq!(sshd.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_close_removes_key_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("authorized_keys");
        let (addr, _sshd) = fake_sshd().await;

        let action = OpaqueSshAgentAction::new()
            .with_authorized_keys(AuthorizedKeys::at_path(&keys_path))
            .await;
        action.start_action(&open_payload(addr.port())).await.unwrap();
        assert!(std::fs::read_to_string(&keys_path).unwrap().contains("bzero-temp-key"));

        action.kill("session end").await;
        let contents = std::fs::read_to_string(&keys_path).unwrap();
        assert!(!contents.contains("bzero-temp-key"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_user_before_touching_files() {
        let action = OpaqueSshAgentAction::new();
        let payload = serde_json::to_vec(&SshOpenPayload {
            target_user: "Robert'); DROP".into(),
            public_key: "AAAA".into(),
            key_type: "ssh-rsa".into(),
            ssh_port: 2222,
        })
        .unwrap();
        assert!(action.start_action(&payload).await.is_err());
    }
}
