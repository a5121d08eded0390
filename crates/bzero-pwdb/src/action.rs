//! The agent-side `db/pwdb` plugin action.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_config::{Backend, ConfigError, KeyShardData, KeyShardStore, ShardKeyPair};
use bzero_datachannel::{Outbox, PluginAction, PluginMessage, Tomb};
use bzero_types::{actions, StreamMessage, StreamType, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::proxy::{BrokeringProxy, DelegatedAuth};
use crate::splitcert::{self, CertificateCoSigner};
use crate::token::{GcpIamTokenProvider, RdsIamTokenProvider, TokenProvider};
use crate::ConnectionMode;

const CHUNK_SIZE: usize = 64 * 1024;
/// Buffer of the in-memory listener between datachannel and proxy.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Subactions under `db/pwdb`.
pub mod subactions {
    pub const STOP: &str = "pwdb/stop";
}

/// Syn payload of a `db/pwdb` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PwdbActionPayload {
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "targetUser")]
    pub target_user: String,
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
    #[serde(rename = "schemaVersion", default = "default_schema")]
    pub schema_version: String,
}

fn default_schema() -> String {
    bzero_types::SCHEMA_VERSION.to_string()
}

/// Source of the split-key material for a target.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn key_for_target(&self, target_id: &str) -> Result<ShardKeyPair, TunnelError>;
}

#[async_trait]
impl<B: Backend<KeyShardData> + 'static> KeyProvider for KeyShardStore<B> {
    async fn key_for_target(&self, target_id: &str) -> Result<ShardKeyPair, TunnelError> {
        self.last_key(target_id).await.map_err(|e| match e {
            ConfigError::Target(target) => TunnelError::PwdbMissingKey(target),
            other => TunnelError::Internal(other.to_string()),
        })
    }
}

trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Agent-side pwdb: selects the connection mode from the host prefix,
/// authenticates without any long-lived secret, and shuttles bytes between
/// the resulting connection and the datachannel.
pub struct PwdbAgentAction {
    outbox: Outbox,
    tomb: Tomb,
    keys: Arc<dyn KeyProvider>,
    cosigner: Arc<dyn CertificateCoSigner>,
    rds_tokens: Option<Arc<dyn TokenProvider>>,
    gcp_tokens: Arc<dyn TokenProvider>,
    writer: Mutex<Option<WriteHalf<Box<dyn SessionStream>>>>,
}

impl PwdbAgentAction {
    pub fn new(keys: Arc<dyn KeyProvider>, cosigner: Arc<dyn CertificateCoSigner>) -> Self {
        Self {
            outbox: Outbox::default(),
            tomb: Tomb::new(),
            keys,
            cosigner,
            rds_tokens: None,
            gcp_tokens: Arc::new(GcpIamTokenProvider),
            writer: Mutex::new(None),
        }
    }

    /// Override the RDS token provider (tests, alternative brokers).
    pub fn with_rds_tokens(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.rds_tokens = Some(provider);
        self
    }

    /// Override the GCP token provider.
    pub fn with_gcp_tokens(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.gcp_tokens = provider;
        self
    }

    /// Spawn the read pump over the session stream and park the write half.
    async fn wire_stream(&self, stream: Box<dyn SessionStream>, peer_schema: String) {
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let outbox = self.outbox.sender();
        let tomb = self.tomb.clone();
        tokio::spawn(async move {
            pump_session_reads(reader, outbox, tomb, &peer_schema).await;
        });
    }

    /// Start the brokering proxy for a token-delegated mode and wire the
    /// near end of the in-memory listener as the session stream.
    async fn start_brokered(
        &self,
        host: &str,
        port: u16,
        db_user: &str,
        token: String,
        tls_upstream: bool,
        peer_schema: String,
    ) {
        let (session_end, proxy_end) = tokio::io::duplex(DUPLEX_BUFFER);

        let proxy = BrokeringProxy {
            upstream_host: host.to_string(),
            upstream_port: port,
            auth: DelegatedAuth {
                db_user: db_user.to_string(),
                token,
            },
            tls_upstream,
        };

        let tomb = self.tomb.clone();
        let outbox = self.outbox.sender();
        tokio::spawn(async move {
            match proxy.run(proxy_end, tomb.clone()).await {
                Ok(()) => {
                    tomb.kill(None);
                    tomb.mark_dead();
                }
                Err(e) => {
                    // surface the failure promptly as a terminal frame
                    let frame = StreamMessage::new(
                        actions::DB_PWDB,
                        StreamType::Error,
                        0,
                        e.to_string().as_bytes(),
                    );
                    let _ = outbox.send(PluginMessage::Stream(frame)).await;
                    tomb.kill(Some(e.to_string()));
                    tomb.mark_dead();
                }
            }
        });

        self.wire_stream(Box::new(session_end), peer_schema).await;
    }
}

#[async_trait]
impl PluginAction for PwdbAgentAction {
    fn action_name(&self) -> &str {
        actions::DB_PWDB
    }

    async fn start_action(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let params: PwdbActionPayload = serde_json::from_slice(payload)
            .map_err(|e| TunnelError::Internal(format!("bad pwdb payload: {}", e)))?;

        match ConnectionMode::parse(&params.target_host) {
            ConnectionMode::SplitCert { host } => {
                let shard = self.keys.key_for_target(&params.target_id).await?;
                let tls = splitcert::connect(
                    &host,
                    params.target_port,
                    &params.target_user,
                    &shard,
                    self.cosigner.as_ref(),
                )
                .await?;
                self.wire_stream(Box::new(tls), params.schema_version).await;
            }
            ConnectionMode::Rds { host } => {
                let provider: Arc<dyn TokenProvider> = match &self.rds_tokens {
                    Some(provider) => Arc::clone(provider),
                    None => Arc::new(RdsIamTokenProvider::from_endpoint(&host)?),
                };
                let token = provider
                    .fetch_token(&host, params.target_port, &params.target_user)
                    .await?;
                self.start_brokered(
                    &host,
                    params.target_port,
                    &params.target_user,
                    token,
                    true,
                    params.schema_version,
                )
                .await;
            }
            ConnectionMode::Gcp { host } => {
                let token = self
                    .gcp_tokens
                    .fetch_token(&host, params.target_port, &params.target_user)
                    .await?;
                self.start_brokered(
                    &host,
                    params.target_port,
                    &params.target_user,
                    token,
                    true,
                    params.schema_version,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn receive(&self, subaction: &str, _payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        match subaction {
            subactions::STOP => {
                self.kill("stopped by peer").await;
                Ok(Vec::new())
            }
            other => Err(TunnelError::Internal(format!(
                "unhandled pwdb subaction '{}'",
                other
            ))),
        }
    }

    async fn receive_stream(&self, msg: StreamMessage) {
        let Ok(content) = msg.decode_content() else {
            tracing::warn!("undecodable pwdb stream content");
            return;
        };
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return;
        };
        if !content.is_empty() {
            if let Err(e) = writer.write_all(&content).await {
                self.tomb.kill(Some(format!("session write failed: {}", e)));
                self.tomb.mark_dead();
                return;
            }
            let _ = writer.flush().await;
        }
        if !msg.more || msg.stream_type == StreamType::DbStreamEnd {
            let _ = writer.shutdown().await;
        }
    }

    async fn take_outbox(&self) -> Option<tokio::sync::mpsc::Receiver<PluginMessage>> {
        self.outbox.take().await
    }

    async fn kill(&self, reason: &str) {
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

async fn pump_session_reads(
    mut reader: ReadHalf<Box<dyn SessionStream>>,
    outbox: tokio::sync::mpsc::Sender<PluginMessage>,
    tomb: Tomb,
    peer_schema: &str,
) {
    let legacy = bzero_types::is_legacy_schema(peer_schema);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = tomb.dying() => return,
        };
        match read {
            Ok(0) => {
                let terminal = if legacy {
                    StreamMessage::new(actions::DB_PWDB, StreamType::DbStreamEnd, 0, &[])
                } else {
                    StreamMessage::terminal(actions::DB_PWDB, StreamType::Stream, 0)
                };
                let _ = outbox.send(PluginMessage::Stream(terminal)).await;
                tomb.kill(None);
                tomb.mark_dead();
                return;
            }
            Ok(n) => {
                let frame = StreamMessage::new(actions::DB_PWDB, StreamType::Stream, 0, &buf[..n]);
                if outbox.send(PluginMessage::Stream(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tomb.kill(Some(format!("session read failed: {}", e)));
                tomb.mark_dead();
                return;
            }
        }
    }
}
