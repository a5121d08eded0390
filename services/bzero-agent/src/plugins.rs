//! Agent-side plugin instantiation from Syn action names.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_bastion::{BastionClient, CoSignCertificateRequest, IdentityProvider};
use bzero_config::{AgentData, AgentType, KeyShardData, KeyShardStore};
use bzero_datachannel::PluginAction;
use bzero_dial::DialAgentAction;
use bzero_kube::{InClusterForwarder, KubeAgentAction};
use bzero_pwdb::splitcert::{CertificateCoSigner, CoSignRequest};
use bzero_pwdb::PwdbAgentAction;
use bzero_shell::ShellAgentAction;
use bzero_ssh::{OpaqueSshAgentAction, TransparentSshAgentAction};
use bzero_types::{actions, TunnelError};

use crate::backend::AnyBackend;

/// Co-signs client certificates through the bastion endpoint, attaching a
/// fresh identity token per call.
pub struct BastionCoSigner {
    pub client: Arc<BastionClient>,
    pub identity: Arc<IdentityProvider<AnyBackend<AgentData>>>,
}

#[async_trait]
impl CertificateCoSigner for BastionCoSigner {
    async fn cosign(&self, request: CoSignRequest) -> Result<String, TunnelError> {
        let token = self
            .identity
            .token()
            .await
            .map_err(|e| TunnelError::ClientCertCosign(e.to_string()))?;
        self.client
            .cosign_certificate(
                &token,
                &CoSignCertificateRequest {
                    target_user: request.target_user,
                    client_certificate: request.client_certificate_pem,
                    client_public_key: request.client_public_key_pem,
                    key_shard_hash: request.key_shard_hash,
                },
            )
            .await
            .map_err(|e| TunnelError::ClientCertCosign(e.to_string()))
    }
}

/// Everything the factory needs to build any agent-side action.
pub struct PluginFactory {
    pub key_shards: Arc<KeyShardStore<AnyBackend<KeyShardData>>>,
    pub cosigner: Arc<dyn CertificateCoSigner>,
    pub agent_type: AgentType,
    /// Set on Kubernetes agents; built once at startup from the mounted
    /// service-account volume.
    pub kube_forwarder: Option<Arc<InClusterForwarder>>,
}

impl PluginFactory {
    /// Instantiate the agent half of `action`.
    pub fn build(&self, action: &str) -> Result<Arc<dyn PluginAction>, TunnelError> {
        match action {
            actions::DB_DIAL => Ok(Arc::new(DialAgentAction::new())),
            actions::DB_PWDB => Ok(Arc::new(PwdbAgentAction::new(
                Arc::clone(&self.key_shards) as _,
                Arc::clone(&self.cosigner),
            ))),
            actions::SSH_OPAQUE => Ok(Arc::new(OpaqueSshAgentAction::new())),
            actions::SSH_TRANSPARENT => Ok(Arc::new(TransparentSshAgentAction::new())),
            actions::SHELL_DEFAULT => Ok(Arc::new(ShellAgentAction::new())),
            actions::KUBE_RESTAPI
            | actions::KUBE_EXEC
            | actions::KUBE_PORTFORWARD
            | actions::KUBE_STREAM => {
                if self.agent_type != AgentType::Kubernetes {
                    return Err(TunnelError::Internal(
                        "kube actions require a kubernetes agent".into(),
                    ));
                }
                let forwarder = self
                    .kube_forwarder
                    .as_ref()
                    .ok_or_else(|| TunnelError::Internal("no in-cluster credentials".into()))?;
                Ok(Arc::new(KubeAgentAction::new(Arc::clone(forwarder) as _)))
            }
            other => Err(TunnelError::Internal(format!("unknown action '{}'", other))),
        }
    }
}
