//! BastionZero Daemon - the operator-workstation process.
//!
//! One mode per invocation, chosen by the ZLI: a local listener (db, ssh,
//! kube) or stdio plumbing (opaque ssh, shell), each session carried over a
//! fresh datachannel on the shared daemon websocket.
//!
//! ```bash
//! # password-less database tunnel on localhost:5432
//! bzero-daemon --connection-url wss://cloud.bastionzero.com/hub/daemon \
//!     db --listen 127.0.0.1:5432 --target-id t1 --target-user alice \
//!     --target-host db.internal --target-port 5432
//!
//! # transparent ssh for scp/sftp on localhost:2222
//! bzero-daemon --connection-url wss://cloud.bastionzero.com/hub/daemon \
//!     ssh-transparent --listen 127.0.0.1:2222 --target-user alice
//! ```

mod kube_opener;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bzero_datachannel::{DataChannel, Handshaker, NoopHandshaker, PluginAction};
use bzero_dial::{DialActionPayload, DialDaemonAction};
use bzero_pwdb::PwdbActionPayload;
use bzero_shell::ShellOpenPayload;
use bzero_ssh::{OpaqueSshDaemonAction, SshOpenPayload, TransparentOpenPayload, TransparentSshDaemon};
use bzero_transport::{Broker, Role, Websocket, WebsocketConfig};
use bzero_types::{actions, new_channel_id, AgentMessage};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Grace granted to in-flight streams before the websocket closes.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// BastionZero Daemon
#[derive(Parser, Debug)]
#[command(name = "bzero-daemon", about = "BastionZero zero-trust access daemon", version)]
struct Args {
    /// Daemon websocket endpoint on the bastion
    #[arg(long, env = "BZERO_CONNECTION_URL")]
    connection_url: String,

    /// Connection id issued by the ZLI
    #[arg(long, default_value = "", env = "BZERO_CONNECTION_ID")]
    connection_id: String,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// TCP tunnel or password-less database access
    Db {
        #[arg(long, default_value = "127.0.0.1:5432")]
        listen: String,
        #[arg(long, default_value = "")]
        target_id: String,
        #[arg(long, default_value = "")]
        target_user: String,
        #[arg(long)]
        target_host: String,
        #[arg(long)]
        target_port: u16,
        /// Use split-certificate / IAM brokering instead of a plain tunnel
        #[arg(long, default_value = "false")]
        pwdb: bool,
    },
    /// Opaque SSH over stdio (invoked as a ProxyCommand)
    SshOpaque {
        #[arg(long)]
        target_user: String,
        /// Session public key installed on the target, base64
        #[arg(long)]
        public_key: String,
    },
    /// Transparent SSH: local SSH server gating scp/sftp/git
    SshTransparent {
        #[arg(long, default_value = "127.0.0.1:2222")]
        listen: String,
        #[arg(long)]
        target_user: String,
    },
    /// Kubernetes API proxy for kubectl
    Kube {
        #[arg(long, default_value = "127.0.0.1:6443")]
        listen: String,
        /// Token kubectl must present, first segment of the bearer
        #[arg(long)]
        localhost_token: String,
    },
    /// Interactive shell
    Shell {
        #[arg(long)]
        target_user: String,
        /// Reattach to an existing session's datachannel id
        #[arg(long)]
        attach: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_env("BZERO_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let url = Url::parse(&args.connection_url).context("parsing connection url")?;
    let mut ws_config = WebsocketConfig::new(url, Role::DaemonData);
    if !args.connection_id.is_empty() {
        ws_config
            .params
            .push(("connection_id".to_string(), args.connection_id.clone()));
    }

    let broker = Arc::new(Broker::new());
    let selector: bzero_transport::TargetSelector =
        Arc::new(|_msg: &AgentMessage| "ResponseDaemonToBastionV1".to_string());
    let websocket = Websocket::connect(ws_config, Arc::clone(&broker), selector)
        .await
        .context("connecting daemon websocket")?;
    tracing::info!("daemon websocket established");

    let handshaker: Arc<dyn Handshaker> = Arc::new(NoopHandshaker);

    let result = match args.mode {
        Mode::Db {
            listen,
            target_id,
            target_user,
            target_host,
            target_port,
            pwdb,
        } => {
            run_db_listener(
                &websocket, &handshaker, &listen, &target_id, &target_user, &target_host,
                target_port, pwdb,
            )
            .await
        }
        Mode::SshOpaque {
            target_user,
            public_key,
        } => run_opaque_ssh(&websocket, &handshaker, &target_user, &public_key).await,
        Mode::SshTransparent { listen, target_user } => {
            run_transparent_ssh(&websocket, &handshaker, &listen, &target_user).await
        }
        Mode::Kube {
            listen,
            localhost_token,
        } => run_kube_listener(&websocket, &handshaker, &listen, &localhost_token).await,
        Mode::Shell {
            target_user,
            attach,
        } => run_shell(&websocket, &handshaker, &target_user, attach).await,
    };

    // give the last stream frames a chance to drain before teardown
    websocket.close("daemon exiting").await;
    tokio::time::timeout(DRAIN_GRACE, websocket.closed()).await.ok();
    result
}

/// One datachannel per accepted database connection.
#[allow(clippy::too_many_arguments)]
async fn run_db_listener(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    listen: &str,
    target_id: &str,
    target_user: &str,
    target_host: &str,
    target_port: u16,
    pwdb: bool,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    tracing::info!(listen, pwdb, "database listener ready");

    loop {
        let (connection, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        tracing::info!(%peer, "database client connected");

        let (action, syn_payload) = if pwdb {
            (
                actions::DB_PWDB,
                serde_json::to_vec(&PwdbActionPayload {
                    target_id: target_id.to_string(),
                    target_user: target_user.to_string(),
                    target_host: target_host.to_string(),
                    target_port,
                    schema_version: bzero_types::SCHEMA_VERSION.to_string(),
                })?,
            )
        } else {
            (
                actions::DB_DIAL,
                serde_json::to_vec(&DialActionPayload::new(target_host, target_port))?,
            )
        };

        let plugin: Arc<dyn PluginAction> = Arc::new(DialDaemonAction::for_action(
            connection,
            bzero_types::SCHEMA_VERSION,
            action,
        ));
        open_channel(websocket, handshaker, plugin, action, syn_payload, true).await?;
    }
}

async fn run_opaque_ssh(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    target_user: &str,
    public_key: &str,
) -> Result<()> {
    // the daemon validates before anything touches the target's files
    if !bzero_ssh::validate_target_user(target_user) {
        anyhow::bail!("invalid target user '{}'", target_user);
    }
    if !bzero_ssh::validate_public_key(public_key) {
        anyhow::bail!("public key is not valid base64");
    }

    let plugin = Arc::new(OpaqueSshDaemonAction::new());
    plugin
        .wire_stdio(tokio::io::stdin(), tokio::io::stdout())
        .await;

    let syn_payload = serde_json::to_vec(&SshOpenPayload {
        target_user: target_user.to_string(),
        public_key: public_key.to_string(),
        key_type: "ssh-rsa".to_string(),
        ssh_port: 22,
    })?;

    let channel = open_channel(
        websocket,
        handshaker,
        plugin.clone() as Arc<dyn PluginAction>,
        actions::SSH_OPAQUE,
        syn_payload,
        true,
    )
    .await?;

    channel.done().await;
    match channel.err() {
        // stdin closing out from under us is how every session ends
        None => Ok(()),
        Some(e) => anyhow::bail!("ssh session failed: {}", e),
    }
}

async fn run_transparent_ssh(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    listen: &str,
    target_user: &str,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    tracing::info!(listen, "transparent ssh listener ready");

    loop {
        let (connection, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };

        let plugin = TransparentSshDaemon::new();
        let syn_payload = serde_json::to_vec(&TransparentOpenPayload {
            target_user: target_user.to_string(),
        })?;
        let channel = open_channel(
            websocket,
            handshaker,
            plugin.clone() as Arc<dyn PluginAction>,
            actions::SSH_TRANSPARENT,
            syn_payload,
            true,
        )
        .await?;

        if let Err(e) = plugin.serve_connection(connection).await {
            tracing::warn!(error = %e, "ssh termination failed");
            channel.close("ssh termination failed").await;
        }
    }
}

async fn run_kube_listener(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    listen: &str,
    localhost_token: &str,
) -> Result<()> {
    let opener = Arc::new(kube_opener::DaemonChannelOpener {
        websocket: websocket.clone(),
        handshaker: Arc::clone(handshaker),
    });
    let router = bzero_kube::daemon::listener_router(localhost_token, opener);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    tracing::info!(listen, "kube listener ready");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving kube listener")
}

async fn run_shell(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    target_user: &str,
    attach: Option<String>,
) -> Result<()> {
    let plugin = Arc::new(ShellStdioAction::new());
    plugin
        .wire_stdio(tokio::io::stdin(), tokio::io::stdout())
        .await;

    let syn_payload = serde_json::to_vec(&ShellOpenPayload {
        target_user: target_user.to_string(),
        shell: "/bin/bash".to_string(),
        attach: attach.is_some(),
    })?;

    // attach reuses the existing channel id; fresh sessions mint one
    let channel = match &attach {
        Some(channel_id) => {
            DataChannel::open(
                Arc::new(websocket.clone()),
                websocket.broker(),
                channel_id,
                Arc::clone(handshaker),
                plugin.clone() as Arc<dyn PluginAction>,
                actions::SHELL_DEFAULT,
                syn_payload,
                true,
                false,
            )
            .await
            .map_err(|e| anyhow::anyhow!("attaching shell channel: {}", e))?
        }
        None => {
            // shell channels open with a bare OpenDataChannel so the agent
            // can host late attaches without a keysplitting round-trip
            open_channel(
                websocket,
                handshaker,
                plugin.clone() as Arc<dyn PluginAction>,
                actions::SHELL_DEFAULT,
                syn_payload,
                false,
            )
            .await?
        }
    };

    if attach.is_some() {
        let _ = plugin
            .outbox_sender()
            .send(bzero_datachannel::PluginMessage::Command {
                subaction: bzero_shell::subactions::ATTACH.to_string(),
                payload: Vec::new(),
            })
            .await;
    }

    tracing::info!(channel_id = %channel.channel_id(), "shell session ready");
    channel.done().await;
    match channel.err() {
        None => Ok(()),
        Some(e) => anyhow::bail!("shell session failed: {}", e),
    }
}

async fn open_channel(
    websocket: &Websocket,
    handshaker: &Arc<dyn Handshaker>,
    plugin: Arc<dyn PluginAction>,
    action: &str,
    syn_payload: Vec<u8>,
    open_with_syn: bool,
) -> Result<Arc<DataChannel>> {
    let channel_id = new_channel_id();
    DataChannel::open(
        Arc::new(websocket.clone()),
        websocket.broker(),
        &channel_id,
        Arc::clone(handshaker),
        plugin,
        action,
        syn_payload,
        false,
        open_with_syn,
    )
    .await
    .map_err(|e| anyhow::anyhow!("opening channel for {}: {}", action, e))
}

/// Stdio plumbing for the shell mode: keystrokes out as `shell/input`
/// commands, stream frames onto stdout.
struct ShellStdioAction {
    inner: OpaqueSshDaemonAction,
}

impl std::ops::Deref for ShellStdioAction {
    type Target = OpaqueSshDaemonAction;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ShellStdioAction {
    fn new() -> Self {
        Self {
            inner: OpaqueSshDaemonAction::new(),
        }
    }

    async fn wire_stdio(
        &self,
        input: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        output: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) {
        self.inner.wire_stdio(input, output).await;
    }
}

#[async_trait::async_trait]
impl PluginAction for ShellStdioAction {
    fn action_name(&self) -> &str {
        actions::SHELL_DEFAULT
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), bzero_types::TunnelError> {
        self.inner.start_action(payload).await
    }

    async fn receive(
        &self,
        subaction: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, bzero_types::TunnelError> {
        self.inner.receive(subaction, payload).await
    }

    async fn receive_stream(&self, msg: bzero_types::StreamMessage) {
        self.inner.receive_stream(msg).await;
    }

    async fn take_outbox(
        &self,
    ) -> Option<tokio::sync::mpsc::Receiver<bzero_datachannel::PluginMessage>> {
        // rewrite the stdio pump's subactions for the shell plugin
        let mut inner_rx = self.inner.take_outbox().await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(msg) = inner_rx.recv().await {
                let translated = match msg {
                    bzero_datachannel::PluginMessage::Command { subaction, payload }
                        if subaction == bzero_ssh::subactions::INPUT =>
                    {
                        bzero_datachannel::PluginMessage::Command {
                            subaction: bzero_shell::subactions::INPUT.to_string(),
                            payload,
                        }
                    }
                    other => other,
                };
                if tx.send(translated).await.is_err() {
                    return;
                }
            }
        });
        Some(rx)
    }

    async fn kill(&self, reason: &str) {
        self.inner.kill(reason).await;
    }

    fn tomb(&self) -> &bzero_datachannel::Tomb {
        self.inner.tomb()
    }
}
