//! Opens one datachannel per classified kubectl request.

use std::sync::Arc;

use async_trait::async_trait;
use bzero_datachannel::{DataChannel, Handshaker, PluginAction};
use bzero_kube::{KubeChannelOpener, KubeDaemonAction, RequestClass};
use bzero_transport::Websocket;
use bzero_types::{new_channel_id, TunnelError};

pub struct DaemonChannelOpener {
    pub websocket: Websocket,
    pub handshaker: Arc<dyn Handshaker>,
}

#[async_trait]
impl KubeChannelOpener for DaemonChannelOpener {
    async fn open(
        &self,
        class: RequestClass,
        plugin: Arc<KubeDaemonAction>,
    ) -> Result<(), TunnelError> {
        let channel_id = new_channel_id();
        DataChannel::open(
            Arc::new(self.websocket.clone()),
            self.websocket.broker(),
            &channel_id,
            Arc::clone(&self.handshaker),
            plugin as Arc<dyn PluginAction>,
            class.action(),
            Vec::new(),
            false,
            false,
        )
        .await
        .map_err(|e| TunnelError::Internal(format!("opening kube channel: {}", e)))?;
        Ok(())
    }
}
