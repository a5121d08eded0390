//! Agent-side `shell/default`.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::replay::ReplayBuffer;
use crate::subactions;

/// Syn payload of a `shell/default` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOpenPayload {
    #[serde(rename = "targetUser")]
    pub target_user: String,
    /// Shell binary to run on the PTY slave.
    #[serde(rename = "shell", default = "default_shell")]
    pub shell: String,
    /// True when the daemon is rejoining an existing session.
    #[serde(rename = "attach", default)]
    pub attach: bool,
}

fn default_shell() -> String {
    "/bin/sh".into()
}

/// Window-size payload of `shell/resize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

/// Reattachable PTY session. Output is streamed live and mirrored into the
/// replay buffer; an `attach` replays the buffer before the live stream
/// continues.
pub struct ShellAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    writer: Mutex<Option<tokio::fs::File>>,
    master_fd: Mutex<Option<i32>>,
    replay: Arc<Mutex<ReplayBuffer>>,
}

impl ShellAgentAction {
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            writer: Mutex::new(None),
            master_fd: Mutex::new(None),
            replay: Arc::new(Mutex::new(ReplayBuffer::default())),
        }
    }

    async fn send_replay(&self) {
        let snapshot = self.replay.lock().await.snapshot();
        if !snapshot.is_empty() {
            let frame = StreamMessage::new(actions::SHELL_DEFAULT, StreamType::StdOut, 0, &snapshot);
            let _ = self.outbox.send(PluginMessage::Stream(frame)).await;
        }
        let ready = StreamMessage::new(actions::SHELL_DEFAULT, StreamType::Ready, 0, &[]);
        let _ = self.outbox.send(PluginMessage::Stream(ready)).await;
    }
}

impl Default for ShellAgentAction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn open_pty() -> Result<(OwnedFd, OwnedFd), TunnelError> {
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| TunnelError::Internal(format!("openpty failed: {}", e)))?;
    Ok((pty.master, pty.slave))
}

#[async_trait]
impl PluginAction for ShellAgentAction {
    fn action_name(&self) -> &str {
        actions::SHELL_DEFAULT
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let params: ShellOpenPayload = serde_json::from_slice(payload)
            .map_err(|e| TunnelError::Internal(format!("bad shell payload: {}", e)))?;

        let (master, slave) = open_pty()?;
        *self.master_fd.lock().await = Some(master.as_raw_fd());

        let slave_out = slave
            .try_clone()
            .map_err(|e| TunnelError::Internal(e.to_string()))?;
        let slave_err = slave
            .try_clone()
            .map_err(|e| TunnelError::Internal(e.to_string()))?;

        let mut command = tokio::process::Command::new(&params.shell);
        command
            .stdin(Stdio::from(slave))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(slave_err));
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        let mut child = command
            .spawn()
            .map_err(|e| TunnelError::ConnectionFailed(format!("spawn shell: {}", e)))?;

        let master_file = std::fs::File::from(master);
        let read_file = master_file
            .try_clone()
            .map_err(|e| TunnelError::Internal(e.to_string()))?;
        *self.writer.lock().await = Some(tokio::fs::File::from_std(master_file));

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        let replay = Arc::clone(&self.replay);
        tokio::spawn(async move {
            let mut reader = tokio::fs::File::from_std(read_file);
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let read = tokio::select! {
                    read = reader.read(&mut buf) => read,
                    _ = tomb.dying() => break,
                };
                match read {
                    // EIO means the slave side is gone: the shell exited
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        replay.lock().await.push(&buf[..n]);
                        let frame = StreamMessage::new(
                            actions::SHELL_DEFAULT,
                            StreamType::StdOut,
                            0,
                            &buf[..n],
                        );
                        if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let terminal = StreamMessage::terminal(actions::SHELL_DEFAULT, StreamType::StdOut, 0);
            let _ = outbox.send(PluginMessage::Stream(terminal)).await;
            // a shell that quit on its own is a clean exit
            tomb.kill(None);
            tomb.mark_dead();
        });

        let reaper_tomb = self.tomb.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = reaper_tomb.dying() => {
                    let _ = child.kill().await;
                }
            }
        });

        if params.attach {
            self.send_replay().await;
        }
        Ok(())
    }

    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::INPUT => {
                let mut writer = self.writer.lock().await;
                let writer = writer
                    .as_mut()
                    .ok_or_else(|| TunnelError::ShellCancelled)?;
                writer
                    .write_all(payload)
                    .await
                    .map_err(|e| TunnelError::Internal(format!("pty write: {}", e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| TunnelError::Internal(e.to_string()))?;
                Ok(Vec::new())
            }
            subactions::ATTACH => {
                self.send_replay().await;
                Ok(Vec::new())
            }
            subactions::RESIZE => {
                let resize: ResizePayload = serde_json::from_slice(payload)
                    .map_err(|e| TunnelError::Internal(format!("bad resize payload: {}", e)))?;
                if let Some(fd) = *self.master_fd.lock().await {
                    let winsize = nix::pty::Winsize {
                        ws_row: resize.rows,
                        ws_col: resize.cols,
                        ws_xpixel: 0,
                        ws_ypixel: 0,
                    };
                    // TIOCSWINSZ on the master resizes the slave's view
                    let result = unsafe {
                        libc::ioctl(fd, libc::TIOCSWINSZ, &winsize as *const nix::pty::Winsize)
                    };
                    if result != 0 {
                        tracing::warn!("pty resize failed");
                    }
                }
                Ok(Vec::new())
            }
            subactions::CLOSE => {
                self.kill("closed by daemon").await;
                Ok(Vec::new())
            }
            other => Err(TunnelError::Internal(format!(
                "unhandled shell subaction '{}'",
                other
            ))),
        }
    }

    async fn receive_stream(&self, _msg: StreamMessage) {}

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.writer.lock().await.take();
        self.master_fd.lock().await.take();
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
