//! BastionZero Agent - the long-lived process on the target host.
//!
//! Connects the control channel to the bastion (solving the signature
//! challenge on the way up), answers health checks, and stands up a plugin
//! action per incoming datachannel. Durable state lives in the configured
//! backend; a graceful shutdown records its reason for the restart report
//! filed on the next boot.
//!
//! ```bash
//! # host install
//! bzero-agent --backend file --config-dir /etc/bzero
//!
//! # in-cluster
//! bzero-agent --backend kube --target-name my-cluster-target
//! ```

mod backend;
mod plugins;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bzero_bastion::identity::JwksVerifier;
use bzero_bastion::{archive, BastionClient, IdentityProvider};
use bzero_config::kube::{secret_name_for, AGENT_DATA_KEY, KEY_SHARD_KEY};
use bzero_config::{
    AgentData, AgentType, ConfigStore, FileBackend, KeyShardData, KeyShardStore, KubeBackend,
};
use bzero_crypto::IdentityKeypair;
use bzero_datachannel::{DataChannel, HandshakeKind, Handshaker, NoopHandshaker};
use bzero_kube::InClusterForwarder;
use bzero_transport::{Backoff, Broker, Role, Websocket, WebsocketConfig};
use bzero_types::{
    AgentMessage, HealthCheckPayload, MessageType, OpenDataChannelPayload,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use backend::AnyBackend;
use plugins::{BastionCoSigner, PluginFactory};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// BastionZero Agent
#[derive(Parser, Debug)]
#[command(name = "bzero-agent", about = "BastionZero zero-trust access agent", version)]
struct Args {
    /// Durable config backend
    #[arg(long, default_value = "file", env = "BZERO_BACKEND")]
    backend: String,

    /// Directory holding the host-file backend state
    #[arg(long, default_value = "/etc/bzero", env = "BZERO_CONFIG_DIR")]
    config_dir: String,

    /// Target name, used to derive the Kubernetes secret name
    #[arg(long, default_value = "", env = "BZERO_TARGET_NAME")]
    target_name: String,

    /// Override the bastion service URL from the stored config
    #[arg(long, env = "BZERO_SERVICE_URL")]
    service_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_env("BZERO_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // POD_NAME / NAMESPACE are read once here and passed along explicitly.
    let pod_name = std::env::var("POD_NAME").unwrap_or_default();
    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".into());

    let (config_backend, shard_backend) = match args.backend.as_str() {
        "file" => (
            AnyBackend::File(FileBackend::<AgentData>::new(
                format!("{}/bzero-agent.json", args.config_dir),
            )),
            AnyBackend::File(FileBackend::<KeyShardData>::new(
                format!("{}/bzero-keyshards.json", args.config_dir),
            )),
        ),
        "kube" => {
            if args.target_name.is_empty() {
                bail!("--target-name is required with the kube backend");
            }
            let client = kube::Client::try_default()
                .await
                .context("building in-cluster kubernetes client")?;
            let secret = secret_name_for(&args.target_name);
            (
                AnyBackend::Kube(KubeBackend::<AgentData>::new(
                    client.clone(),
                    &namespace,
                    &secret,
                    AGENT_DATA_KEY,
                )),
                AnyBackend::Kube(KubeBackend::<KeyShardData>::new(
                    client,
                    &namespace,
                    &secret,
                    KEY_SHARD_KEY,
                )),
            )
        }
        other => bail!("unknown backend '{}'", other),
    };

    let config = Arc::new(ConfigStore::load(config_backend).await?);
    let key_shards = Arc::new(KeyShardStore::load(shard_backend).await?);

    let target_id = config.target_id().await;
    if target_id.is_empty() {
        bail!("agent is not registered; run registration first");
    }
    let keypair = IdentityKeypair::from_base64(&config.private_key().await)
        .context("loading agent identity key")?;

    let service_url = match &args.service_url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => config.service_url().await,
    };
    let agent_type = config.agent_type().await;

    let bastion = Arc::new(BastionClient::new(&service_url));
    let verifier = Arc::new(JwksVerifier::new(&format!("{}/jwks", service_url)));
    let identity = Arc::new(IdentityProvider::new(
        Arc::clone(&bastion),
        Arc::clone(&config),
        verifier,
        keypair.clone(),
        &target_id,
    ));

    // file the restart report for the previous shutdown, once
    let (shutdown_reason, shutdown_state) = config.shutdown_info().await;
    if !shutdown_reason.is_empty() || !shutdown_state.is_empty() {
        match identity.token().await {
            Ok(token) => {
                if let Err(e) = bastion
                    .report_restart(
                        &token,
                        &target_id,
                        &keypair.public_key_base64(),
                        &shutdown_reason,
                        &shutdown_state,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "restart report failed");
                } else {
                    let _ = config.clear_shutdown_info().await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "no identity token for restart report"),
        }
    }

    if let Err(e) = config.set_version(AGENT_VERSION).await {
        if !e.is_noop() {
            tracing::warn!(error = %e, "failed to persist agent version");
        }
    }

    let kube_forwarder = if agent_type == AgentType::Kubernetes {
        build_in_cluster_forwarder().map(Arc::new)
    } else {
        None
    };

    let factory = Arc::new(PluginFactory {
        key_shards,
        cosigner: Arc::new(BastionCoSigner {
            client: Arc::clone(&bastion),
            identity: Arc::clone(&identity),
        }),
        agent_type,
        kube_forwarder,
    });

    let websocket = connect_control_channel(&service_url, &target_id, &keypair, &bastion).await?;
    tracing::info!(target_id = %target_id, pod = %pod_name, "control channel established");

    let (fallback_tx, mut fallback_rx) = tokio::sync::mpsc::channel::<AgentMessage>(32);
    websocket.set_inbound_fallback(fallback_tx).await;

    let uploads = Arc::new(UploadContext {
        bastion: Arc::clone(&bastion),
        identity: Arc::clone(&identity),
        agent_type,
        namespace,
        pod_name,
        log_path: format!("{}/bzero-agent.log", args.config_dir).into(),
    });

    let handshaker: Arc<dyn Handshaker> = Arc::new(NoopHandshaker);
    let channel_ws = websocket.clone();
    let channel_factory = Arc::clone(&factory);
    let channel_handshaker = Arc::clone(&handshaker);
    let channel_uploads = Arc::clone(&uploads);
    tokio::spawn(async move {
        while let Some(msg) = fallback_rx.recv().await {
            if let Err(e) = handle_control_message(
                &channel_ws,
                &channel_factory,
                &channel_handshaker,
                &channel_uploads,
                msg,
            )
            .await
            {
                tracing::warn!(error = %e, "control message handling failed");
            }
        }
    });

    tokio::select! {
        _ = websocket.closed() => {
            tracing::error!("control channel lost for good");
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            let state = HashMap::from([
                ("signal".to_string(), "SIGTERM".to_string()),
                ("version".to_string(), AGENT_VERSION.to_string()),
            ]);
            if let Err(e) = config.set_shutdown_info("graceful shutdown", state).await {
                tracing::warn!(error = %e, "failed to record shutdown state");
            }
            websocket.close("agent shutting down").await;
        }
    }
    Ok(())
}

async fn connect_control_channel(
    service_url: &str,
    target_id: &str,
    keypair: &IdentityKeypair,
    bastion: &Arc<BastionClient>,
) -> Result<Websocket> {
    let ws_base = service_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let url = Url::parse(&format!("{}/api/v1/hub/control", ws_base))
        .context("building control channel url")?;

    let mut config = WebsocketConfig::new(url, Role::AgentControl);
    config.params = vec![
        ("target_id".to_string(), target_id.to_string()),
        ("version".to_string(), AGENT_VERSION.to_string()),
    ];
    config.backoff = Backoff::new();

    // the challenge solver runs before every upgrade attempt, so a
    // reconnect after a long outage signs a fresh nonce
    let challenge_bastion = Arc::clone(bastion);
    let challenge_keypair = keypair.clone();
    let challenge_target = target_id.to_string();
    config.challenge_solver = Some(Arc::new(move || {
        let bastion = Arc::clone(&challenge_bastion);
        let keypair = challenge_keypair.clone();
        let target_id = challenge_target.clone();
        Box::pin(async move {
            let nonce = bastion
                .get_challenge_nonce(&target_id)
                .await
                .map_err(|e| bzero_transport::TransportError::Connect(e.to_string()))?;
            Ok(vec![
                ("solved_challenge".to_string(), keypair.solve_challenge(&nonce)),
                (
                    "signed_agent_version".to_string(),
                    keypair.sign_base64(AGENT_VERSION.as_bytes()),
                ),
            ])
        })
    }));

    let broker = Arc::new(Broker::new());
    let selector: bzero_transport::TargetSelector =
        Arc::new(|_msg: &AgentMessage| "ResponseAgentToBastionV1".to_string());
    Websocket::connect(config, broker, selector)
        .await
        .context("connecting control channel")
}

/// State the log-upload path needs, captured once at startup.
struct UploadContext {
    bastion: Arc<BastionClient>,
    identity: Arc<IdentityProvider<AnyBackend<AgentData>>>,
    agent_type: AgentType,
    namespace: String,
    pod_name: String,
    log_path: std::path::PathBuf,
}

/// Bastion-initiated request to upload recent logs, carried as a control
/// frame with no channel affinity.
#[derive(serde::Deserialize)]
struct UploadLogsRequest {
    #[serde(rename = "UserEmail")]
    user_email: String,
    #[serde(rename = "UploadLogsRequestId")]
    upload_logs_request_id: String,
}

async fn handle_control_message(
    websocket: &Websocket,
    factory: &Arc<PluginFactory>,
    handshaker: &Arc<dyn Handshaker>,
    uploads: &Arc<UploadContext>,
    msg: AgentMessage,
) -> Result<()> {
    match msg.message_type {
        MessageType::HealthCheck => {
            let payload = serde_json::to_vec(&HealthCheckPayload {
                alive: true,
                agent_version: AGENT_VERSION.to_string(),
            })?;
            websocket
                .send(AgentMessage::control(MessageType::HealthCheck, payload))
                .await?;
        }
        MessageType::OpenDataChannel => {
            let open: OpenDataChannelPayload = serde_json::from_slice(&msg.payload)
                .context("parsing OpenDataChannel payload")?;
            accept_channel(websocket, factory, handshaker, &msg.channel_id, &open.action, open.syn_payload)
                .await?;
        }
        MessageType::Syn => {
            let (action, syn_payload) = handshaker
                .verify(HandshakeKind::Syn, &msg.payload)
                .await
                .map_err(|e| anyhow::anyhow!("syn verification failed: {}", e))?;
            accept_channel(websocket, factory, handshaker, &msg.channel_id, &action, syn_payload)
                .await?;
        }
        MessageType::CloseAllDataChannels => {
            websocket.broker().close("closed by coordinator").await;
        }
        MessageType::Data if msg.channel_id.is_empty() => {
            let request: UploadLogsRequest =
                serde_json::from_slice(&msg.payload).context("parsing upload-logs request")?;
            let uploads = Arc::clone(uploads);
            tokio::spawn(async move {
                if let Err(e) = upload_logs(&uploads, request).await {
                    tracing::warn!(error = %e, "log upload failed");
                }
            });
        }
        other => tracing::debug!(message_type = %other, "unhandled control frame"),
    }
    Ok(())
}

async fn accept_channel(
    websocket: &Websocket,
    factory: &Arc<PluginFactory>,
    handshaker: &Arc<dyn Handshaker>,
    channel_id: &str,
    action: &str,
    syn_payload: Vec<u8>,
) -> Result<()> {
    let plugin = factory
        .build(action)
        .map_err(|e| anyhow::anyhow!("building plugin for {}: {}", action, e))?;
    DataChannel::accept(
        Arc::new(websocket.clone()),
        websocket.broker(),
        channel_id,
        Arc::clone(handshaker),
        plugin,
        action,
        syn_payload,
    )
    .await
    .map_err(|e| anyhow::anyhow!("accepting channel {}: {}", channel_id, e))?;
    tracing::info!(channel_id, action, "datachannel accepted");
    Ok(())
}

async fn upload_logs(context: &UploadContext, request: UploadLogsRequest) -> Result<()> {
    let archive_zip = match context.agent_type {
        AgentType::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("building kubernetes client for log upload")?;
            archive::build_pod_archive(client, &context.namespace, &context.pod_name).await?
        }
        _ => archive::build_host_archive(&context.log_path)?,
    };
    let token = context.identity.token().await?;
    context
        .bastion
        .report_logs(
            &token,
            &request.user_email,
            &request.upload_logs_request_id,
            archive_zip,
        )
        .await?;
    tracing::info!(request_id = %request.upload_logs_request_id, "log archive uploaded");
    Ok(())
}

fn build_in_cluster_forwarder() -> Option<InClusterForwarder> {
    let token = std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/token").ok()?;
    let ca = std::fs::read("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt").ok()?;
    InClusterForwarder::new("https://kubernetes.default.svc", &ca, token.trim()).ok()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
