//! Agent side of transparent SSH: run the approved command as the target
//! user and stream its output back.

use std::process::Stdio;

use async_trait::async_trait;
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;

use crate::whitelist::validate_command;
use crate::{subactions, validate_target_user};

/// Syn payload of an `ssh/transparent` session (agent side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparentOpenPayload {
    #[serde(rename = "targetUser")]
    pub target_user: String,
}

/// Command payload of `ssh/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPayload {
    pub command: String,
}

/// Agent-side `ssh/transparent`: waits for one approved `ssh/exec`, runs
/// it under the target user, and streams stdout/stderr. A clean exit emits
/// the terminal stdout frame; failures emit an `Error` stream frame.
pub struct TransparentSshAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    target_user: Mutex<Option<String>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl TransparentSshAgentAction {
    pub fn new() -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            target_user: Mutex::new(None),
            stdin: Mutex::new(None),
        }
    }

    async fn spawn_command(&self, command_line: &str) -> Result<(), TunnelError> {
        let user = self.target_user.lock().await.clone();
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| TunnelError::Internal("empty command".into()))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        if let Some(user) = user.as_deref() {
            if let Ok(Some(account)) = nix::unistd::User::from_name(user) {
                if account.uid != nix::unistd::geteuid() {
                    command.uid(account.uid.as_raw()).gid(account.gid.as_raw());
                }
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| TunnelError::ConnectionFailed(format!("spawn '{}': {}", program, e)))?;

        *self.stdin.lock().await = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(mut stdout) = stdout {
            let outbox = self.outbox.sender();
            let tomb = self.tomb.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    let read = tokio::select! {
                        read = stdout.read(&mut buf) => read,
                        _ = tomb.dying() => return,
                    };
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let frame = StreamMessage::new(
                                actions::SSH_TRANSPARENT,
                                StreamType::StdOut,
                                0,
                                &buf[..n],
                            );
                            if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        if let Some(mut stderr) = stderr {
            let outbox = self.outbox.sender();
            let tomb = self.tomb.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    let read = tokio::select! {
                        read = stderr.read(&mut buf) => read,
                        _ = tomb.dying() => return,
                    };
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let frame = StreamMessage::new(
                                actions::SSH_TRANSPARENT,
                                StreamType::StdErr,
                                0,
                                &buf[..n],
                            );
                            if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        // the waiter owns the child and decides how the session ends
        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = tomb.dying() => {
                    let _ = child.kill().await;
                    return;
                }
            };
            match status {
                Ok(status) if status.success() => {
                    let terminal = StreamMessage::terminal(
                        actions::SSH_TRANSPARENT,
                        StreamType::StdOut,
                        0,
                    );
                    let _ = outbox.send(PluginMessage::Stream(terminal)).await;
                    tomb.kill(None);
                    tomb.mark_dead();
                }
                Ok(status) => {
                    let message = format!("command exited with {}", status);
                    let frame = StreamMessage::new(
                        actions::SSH_TRANSPARENT,
                        StreamType::Error,
                        0,
                        message.as_bytes(),
                    );
                    let _ = outbox.send(PluginMessage::Stream(frame)).await;
                    tomb.kill(Some(message));
                    tomb.mark_dead();
                }
                Err(e) => {
                    tomb.kill(Some(format!("wait failed: {}", e)));
                    tomb.mark_dead();
                }
            }
        });
        Ok(())
    }
}

impl Default for TransparentSshAgentAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginAction for TransparentSshAgentAction {
    fn action_name(&self) -> &str {
        actions::SSH_TRANSPARENT
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let params: TransparentOpenPayload = serde_json::from_slice(payload)
            .map_err(|e| TunnelError::Internal(format!("bad transparent payload: {}", e)))?;
        if !validate_target_user(&params.target_user) {
            return Err(TunnelError::Internal(format!(
                "invalid target user '{}'",
                params.target_user
            )));
        }
        *self.target_user.lock().await = Some(params.target_user);
        Ok(())
    }

    async fn receive(&self, subaction: &str, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::EXEC => {
                let exec: ExecPayload = serde_json::from_slice(payload)
                    .map_err(|e| TunnelError::Internal(format!("bad exec payload: {}", e)))?;
                // the daemon already vetted this; check again anyway
                let approved = validate_command(&exec.command)
                    .map_err(TunnelError::Internal)?;
                self.spawn_command(approved.command_line()).await?;
                Ok(Vec::new())
            }
            subactions::INPUT => {
                let mut stdin = self.stdin.lock().await;
                if let Some(stdin) = stdin.as_mut() {
                    stdin
                        .write_all(payload)
                        .await
                        .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;
                } else {
                    return Err(TunnelError::SshStdinClosed);
                }
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

    async fn receive_stream(&self, _msg: StreamMessage) {}

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
        self.stdin.lock().await.take();
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

    #[tokio::test]
    async fn test_unapproved_exec_is_refused() {
        let action = TransparentSshAgentAction::new();
        action
            .start_action(&serde_json::to_vec(&TransparentOpenPayload { target_user: "alice".into() }).unwrap())
            .await
            .unwrap();
        let payload = serde_json::to_vec(&ExecPayload { command: "shellfake".into() }).unwrap();
        let err = action.receive(subactions::EXEC, &payload).await.unwrap_err();
        assert!(err.to_string().contains("unauthorized command 'shellfake'"));
    }

    #[tokio::test]
    async fn test_successful_command_emits_terminal_stdout() {
        let action = TransparentSshAgentAction::new();
        action
            .start_action(&serde_json::to_vec(&TransparentOpenPayload { target_user: "alice".into() }).unwrap())
            .await
            .unwrap();
        // bypass the whitelist to exercise the runner with a command that
        // exists everywhere
        action.spawn_command("true").await.unwrap();

        let mut outbox = action.take_outbox().await.unwrap();
        match outbox.recv().await.unwrap() {
            PluginMessage::Stream(msg) => {
                assert_eq!(msg.stream_type, StreamType::StdOut);
                assert!(!msg.more);
            }
            other => panic!("unexpected message {:?}", other),
        }
        action.tomb().dead().await;
        assert_eq!(action.tomb().err(), None);
    }

    #[tokio::test]
    async fn test_failing_command_emits_error_frame() {
        let action = TransparentSshAgentAction::new();
        action
            .start_action(&serde_json::to_vec(&TransparentOpenPayload { target_user: "alice".into() }).unwrap())
            .await
            .unwrap();
        action.spawn_command("false").await.unwrap();

        let mut outbox = action.take_outbox().await.unwrap();
        match outbox.recv().await.unwrap() {
            PluginMessage::Stream(msg) => {
                assert_eq!(msg.stream_type, StreamType::Error);
            }
            other => panic!("unexpected message {:?}", other),
        }
        action.tomb().dead().await;
        assert!(action.tomb().err().is_some());
    }
}
