//! Daemon side of transparent SSH: a minimal SSH server that exists only
//! to gate scp/sftp/git traffic.
//!
//! No client authentication (the ZLI already authenticated the operator),
//! exactly one `session` channel, and only whitelisted requests pass. The
//! rejected request's reason goes to the client's stderr so the operator
//! sees why.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::exec::ExecPayload;
use crate::whitelist::{validate_command, validate_subsystem};
use crate::subactions;

/// Daemon-side `ssh/transparent`. The daemon service accepts connections on
/// the ZLI-specified local port and hands each socket to
/// [`TransparentSshDaemon::serve_connection`].
pub struct TransparentSshDaemon {
    outbox: Outbox,
    tomb: Tomb,
    ssh: Mutex<Option<(russh::server::Handle, ChannelId)>>,
}

impl TransparentSshDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            ssh: Mutex::new(None),
        })
    }

    /// Terminate the SSH protocol on one accepted socket.
    pub async fn serve_connection(self: &Arc<Self>, stream: TcpStream) -> Result<(), TunnelError> {
        let key = russh_keys::key::KeyPair::generate_ed25519()
            .ok_or_else(|| TunnelError::Internal("host key generation failed".into()))?;
        let config = Arc::new(Config {
            methods: MethodSet::NONE,
            keys: vec![key],
            ..Default::default()
        });

        let handler = SessionHandler {
            daemon: Arc::clone(self),
            session_opened: false,
        };
        let running = russh::server::run_stream(config, stream, handler)
            .await
            .map_err(|e| TunnelError::ConnectionFailed(format!("ssh accept: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = running.await {
                tracing::debug!(error = %e, "ssh session ended with error");
            }
        });
        Ok(())
    }

    async fn ssh_handle(&self) -> Option<(russh::server::Handle, ChannelId)> {
        self.ssh.lock().await.clone()
    }
}

#[async_trait]
impl PluginAction for TransparentSshDaemon {
    fn action_name(&self) -> &str {
        actions::SSH_TRANSPARENT
    }

    async fn start_action(&self, _payload: &[u8]) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn receive(&self, _subaction: &str, _payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        Ok(Vec::new())
    }

    /// Agent output flows back into the SSH channel: stdout as data,
    /// stderr as extended data, the terminal stdout frame as exit 0.
    async fn receive_stream(&self, msg: StreamMessage) {
        let Some((handle, channel)) = self.ssh_handle().await else {
            return;
        };
        let content = msg.decode_content().unwrap_or_default();

        match msg.stream_type {
            StreamType::StdOut => {
                if !content.is_empty() {
                    let _ = handle.data(channel, CryptoVec::from(content)).await;
                }
                if !msg.more {
                    let _ = handle.exit_status_request(channel, 0).await;
                    let _ = handle.eof(channel).await;
                    let _ = handle.close(channel).await;
                    self.tomb.kill(None);
                    self.tomb.mark_dead();
                }
            }
            StreamType::StdErr => {
                if !content.is_empty() {
                    let _ = handle.extended_data(channel, 1, CryptoVec::from(content)).await;
                }
            }
            StreamType::Error => {
                let _ = handle.extended_data(channel, 1, CryptoVec::from(content)).await;
                let _ = handle.exit_status_request(channel, 1).await;
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
                self.tomb.kill(Some(
                    String::from_utf8_lossy(&msg.decode_content().unwrap_or_default()).into_owned(),
                ));
                self.tomb.mark_dead();
            }
            _ => {}
        }
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        if let Some((handle, channel)) = self.ssh.lock().await.take() {
            let _ = handle.close(channel).await;
        }
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

struct SessionHandler {
    daemon: Arc<TransparentSshDaemon>,
    session_opened: bool,
}

impl SessionHandler {
    async fn reject(
        &self,
        channel: ChannelId,
        session: &mut Session,
        reason: String,
    ) -> Result<(), russh::Error> {
        tracing::warn!(reason = %reason, "rejecting ssh request");
        session.extended_data(channel, 1, CryptoVec::from(format!("{}\n", reason).into_bytes()));
        session.channel_failure(channel);
        Ok(())
    }

    async fn approve_exec(&self, channel: ChannelId, session: &mut Session, command: String) {
        session.channel_success(channel);
        *self.daemon.ssh.lock().await = Some((session.handle(), channel));
        let payload = serde_json::to_vec(&ExecPayload { command }).expect("payload serializes");
        let _ = self
            .daemon
            .outbox
            .send(PluginMessage::Command {
                subaction: subactions::EXEC.into(),
                payload,
            })
            .await;
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_opened {
            return Ok(false);
        }
        self.session_opened = true;
        *self.daemon.ssh.lock().await = Some((session.handle(), channel.id()));
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        match validate_command(&command) {
            Ok(approved) => {
                self.approve_exec(channel, session, approved.command_line().to_string())
                    .await;
                Ok(())
            }
            Err(reason) => self.reject(channel, session, reason).await,
        }
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match validate_subsystem(name) {
            Ok(approved) => {
                self.approve_exec(channel, session, approved.command_line().to_string())
                    .await;
                Ok(())
            }
            Err(reason) => self.reject(channel, session, reason).await,
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject(channel, session, "unauthorized request 'shell'".into())
            .await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject(channel, session, "unauthorized request 'pty-req'".into())
            .await
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self
            .daemon
            .outbox
            .send(PluginMessage::Command {
                subaction: subactions::INPUT.into(),
                payload: data.to_vec(),
            })
            .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = self
            .daemon
            .outbox
            .send(PluginMessage::Command {
                subaction: subactions::CLOSE.into(),
                payload: Vec::new(),
            })
            .await;
        Ok(())
    }
}
