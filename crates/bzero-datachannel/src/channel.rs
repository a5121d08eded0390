//! The datachannel proper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bzero_types::{
    AgentMessage, ClosePayload, ErrorPayload, MessageType, OpenDataChannelPayload, StreamMessage,
};
use bzero_transport::{Broker, MessageSender, Subscriber};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::handshake::{HandshakeKind, Handshaker};
use crate::ordering::OrderedBuffer;
use crate::plugin::{PluginAction, PluginMessage};
use crate::tomb::Tomb;
use crate::{ChannelError, ChannelResult};

/// Payload of a `Data`/`DataAck` frame: either an opaque keysplitting
/// message or a sequenced stream frame. Tagged so dispatch never string-
/// matches outside the deserializer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DataEnvelope {
    MrTap { message: Vec<u8> },
    Stream { message: StreamMessage },
}

/// One per-session ordered pipe over the shared transport.
pub struct DataChannel {
    inner: Arc<Inner>,
}

struct Inner {
    channel_id: String,
    action: String,
    transport: Arc<dyn MessageSender>,
    broker: Arc<Broker>,
    handshaker: Arc<dyn Handshaker>,
    plugin: Arc<dyn PluginAction>,
    tomb: Tomb,
    /// False on the opener until `SynAck` arrives; outbound payloads buffer
    /// (stay queued in the outbox) until then.
    synced_tx: watch::Sender<bool>,
    inbound: Mutex<OrderedBuffer>,
    outbound_sequence: AtomicU64,
}

impl DataChannel {
    /// Daemon-side construction: subscribe, start the plugin, and (unless
    /// attaching) announce the channel with a keysplitting `Syn` or an
    /// `OpenDataChannel` carrying the action and Syn payload.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        transport: Arc<dyn MessageSender>,
        broker: Arc<Broker>,
        channel_id: &str,
        handshaker: Arc<dyn Handshaker>,
        plugin: Arc<dyn PluginAction>,
        action: &str,
        syn_payload: Vec<u8>,
        attach: bool,
        open_with_syn: bool,
    ) -> ChannelResult<Arc<Self>> {
        let channel = Self::build(
            transport, broker, channel_id, handshaker, plugin, action,
            // attaching rejoins an established channel: no ack will come
            attach,
        )
        .await;

        if let Err(e) = channel.inner.plugin.start_action(&syn_payload).await {
            channel.inner.broker.unsubscribe(channel_id).await;
            return Err(ChannelError::Plugin(e.to_string()));
        }

        if !attach {
            let msg = if open_with_syn {
                let built = channel
                    .inner
                    .handshaker
                    .build(HandshakeKind::Syn, action, &syn_payload)
                    .await
                    .map_err(ChannelError::Verification)?;
                AgentMessage::for_channel(channel_id, MessageType::Syn, built)
            } else {
                let payload = OpenDataChannelPayload {
                    action: action.to_string(),
                    syn_payload,
                };
                AgentMessage::for_channel(
                    channel_id,
                    MessageType::OpenDataChannel,
                    serde_json::to_vec(&payload).expect("payload serializes"),
                )
            };
            channel.inner.transport.send_message(msg).await?;
        }

        channel.spawn_outbox_pump().await;
        Ok(channel)
    }

    /// Agent-side construction, upon an inbound `Syn` or `OpenDataChannel`:
    /// start the plugin and answer `SynAck`.
    pub async fn accept(
        transport: Arc<dyn MessageSender>,
        broker: Arc<Broker>,
        channel_id: &str,
        handshaker: Arc<dyn Handshaker>,
        plugin: Arc<dyn PluginAction>,
        action: &str,
        syn_payload: Vec<u8>,
    ) -> ChannelResult<Arc<Self>> {
        let channel = Self::build(
            transport, broker, channel_id, handshaker, plugin, action, true,
        )
        .await;

        if let Err(e) = channel.inner.plugin.start_action(&syn_payload).await {
            channel.send_error(&e.to_string()).await;
            channel.inner.broker.unsubscribe(channel_id).await;
            return Err(ChannelError::Plugin(e.to_string()));
        }

        let ack = channel
            .inner
            .handshaker
            .build(HandshakeKind::SynAck, action, &[])
            .await
            .map_err(ChannelError::Verification)?;
        channel
            .inner
            .transport
            .send_message(AgentMessage::for_channel(
                channel_id,
                MessageType::SynAck,
                ack,
            ))
            .await?;

        channel.spawn_outbox_pump().await;
        Ok(channel)
    }

    async fn build(
        transport: Arc<dyn MessageSender>,
        broker: Arc<Broker>,
        channel_id: &str,
        handshaker: Arc<dyn Handshaker>,
        plugin: Arc<dyn PluginAction>,
        action: &str,
        synced: bool,
    ) -> Arc<Self> {
        let (synced_tx, _) = watch::channel(synced);
        let inner = Arc::new(Inner {
            channel_id: channel_id.to_string(),
            action: action.to_string(),
            transport,
            broker: Arc::clone(&broker),
            handshaker,
            plugin,
            tomb: Tomb::new(),
            synced_tx,
            inbound: Mutex::new(OrderedBuffer::new()),
            outbound_sequence: AtomicU64::new(0),
        });
        let channel = Arc::new(Self { inner });
        broker
            .subscribe(channel_id, Arc::clone(&channel) as Arc<dyn Subscriber>)
            .await;
        channel
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    pub fn action(&self) -> &str {
        &self.inner.action
    }

    /// Close both halves: tell the peer, kill the plugin, unwind.
    pub async fn close(&self, reason: &str) {
        if !self.inner.tomb.is_alive() {
            return;
        }
        let payload = serde_json::to_vec(&ClosePayload {
            reason: reason.to_string(),
        })
        .expect("payload serializes");
        let _ = self
            .inner
            .transport
            .send_message(AgentMessage::for_channel(
                &self.inner.channel_id,
                MessageType::CloseDataChannel,
                payload,
            ))
            .await;
        self.teardown(None).await;
    }

    /// Resolves when the channel's task group is fully dead.
    pub async fn done(&self) {
        self.inner.tomb.dead().await;
    }

    /// Terminal error, if the channel died with one.
    pub fn err(&self) -> Option<String> {
        self.inner.tomb.err()
    }

    async fn teardown(&self, error: Option<String>) {
        self.inner.plugin.kill(error.as_deref().unwrap_or("channel closed")).await;
        self.inner.broker.unsubscribe(&self.inner.channel_id).await;
        self.inner.tomb.kill(error);
        self.inner.tomb.mark_dead();
    }

    async fn send_error(&self, message: &str) {
        let payload = serde_json::to_vec(&ErrorPayload {
            message: message.to_string(),
        })
        .expect("payload serializes");
        let _ = self
            .inner
            .transport
            .send_message(AgentMessage::for_channel(
                &self.inner.channel_id,
                MessageType::Error,
                payload,
            ))
            .await;
    }

    async fn spawn_outbox_pump(self: &Arc<Self>) {
        let Some(mut outbox) = self.inner.plugin.take_outbox().await else {
            tracing::warn!(channel_id = %self.inner.channel_id, "plugin outbox already taken");
            return;
        };
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let plugin_tomb = channel.inner.plugin.tomb().clone();
            loop {
                tokio::select! {
                    biased;

                    msg = outbox.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = channel.send_plugin_message(msg).await {
                                tracing::warn!(error = %e, "outbound send failed, killing channel");
                                channel.teardown(Some(e.to_string())).await;
                                return;
                            }
                        }
                        None => break,
                    },

                    _ = plugin_tomb.dying() => {
                        // flush anything the plugin queued before it died
                        while let Ok(msg) = outbox.try_recv() {
                            if channel.send_plugin_message(msg).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }

                    _ = channel.inner.tomb.dying() => return,
                }
            }

            let error = channel.inner.plugin.tomb().err();
            match &error {
                Some(message) => channel.send_error(message).await,
                None => {}
            }
            let payload = serde_json::to_vec(&ClosePayload {
                reason: error.clone().unwrap_or_else(|| "session complete".into()),
            })
            .expect("payload serializes");
            let _ = channel
                .inner
                .transport
                .send_message(AgentMessage::for_channel(
                    &channel.inner.channel_id,
                    MessageType::CloseDataChannel,
                    payload,
                ))
                .await;
            channel.teardown(error).await;
        });
    }

    async fn send_plugin_message(&self, msg: PluginMessage) -> ChannelResult<()> {
        if !self.wait_synced().await {
            return Err(ChannelError::Closed("channel died before SynAck".into()));
        }
        let envelope = match msg {
            PluginMessage::Stream(mut stream) => {
                stream.sequence_number = self.inner.outbound_sequence.fetch_add(1, Ordering::SeqCst);
                DataEnvelope::Stream { message: stream }
            }
            PluginMessage::Command { subaction, payload } => {
                let built = self
                    .inner
                    .handshaker
                    .build(HandshakeKind::Data, &subaction, &payload)
                    .await
                    .map_err(ChannelError::Verification)?;
                DataEnvelope::MrTap { message: built }
            }
        };
        let msg = AgentMessage::for_channel(
            &self.inner.channel_id,
            MessageType::Data,
            serde_json::to_vec(&envelope).expect("envelope serializes"),
        );
        self.inner.transport.send_message(msg).await?;
        Ok(())
    }

    /// Suspend until the opening handshake completes or the tomb dies.
    async fn wait_synced(&self) -> bool {
        let mut rx = self.inner.synced_tx.subscribe();
        loop {
            if *rx.borrow() {
                return true;
            }
            tokio::select! {
                _ = self.inner.tomb.dying() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn handle_stream(&self, message: StreamMessage) {
        let ready = {
            let mut inbound = self.inner.inbound.lock().await;
            inbound.push(message)
        };
        for msg in ready {
            self.inner.plugin.receive_stream(msg).await;
        }
    }

    async fn handle_mrtap(&self, kind: HandshakeKind, message: &[u8]) {
        match self.inner.handshaker.verify(kind, message).await {
            Ok((subaction, payload)) => {
                match self.inner.plugin.receive(&subaction, &payload).await {
                    Ok(response) => {
                        // only command legs produce an ack leg
                        if kind == HandshakeKind::Data {
                            if let Err(e) = self.send_ack(&subaction, &response).await {
                                tracing::warn!(error = %e, "failed to send DataAck");
                            }
                        }
                    }
                    Err(e) => {
                        self.send_error(&e.to_string()).await;
                        self.teardown(Some(e.to_string())).await;
                    }
                }
            }
            Err(e) => {
                // keysplitting verification failure is channel-fatal
                self.send_error(&e).await;
                self.teardown(Some(e)).await;
            }
        }
    }

    async fn send_ack(&self, subaction: &str, payload: &[u8]) -> ChannelResult<()> {
        let built = self
            .inner
            .handshaker
            .build(HandshakeKind::DataAck, subaction, payload)
            .await
            .map_err(ChannelError::Verification)?;
        let envelope = DataEnvelope::MrTap { message: built };
        self.inner
            .transport
            .send_message(AgentMessage::for_channel(
                &self.inner.channel_id,
                MessageType::DataAck,
                serde_json::to_vec(&envelope).expect("envelope serializes"),
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for DataChannel {
    async fn receive(&self, msg: AgentMessage) {
        match msg.message_type {
            MessageType::SynAck => {
                match self
                    .inner
                    .handshaker
                    .verify(HandshakeKind::SynAck, &msg.payload)
                    .await
                {
                    Ok(_) => {
                        self.inner.synced_tx.send_replace(true);
                    }
                    Err(e) => {
                        self.send_error(&e).await;
                        self.teardown(Some(e)).await;
                    }
                }
            }
            MessageType::Data | MessageType::DataAck => {
                match serde_json::from_slice::<DataEnvelope>(&msg.payload) {
                    Ok(DataEnvelope::Stream { message }) => self.handle_stream(message).await,
                    Ok(DataEnvelope::MrTap { message }) => {
                        let kind = if msg.message_type == MessageType::Data {
                            HandshakeKind::Data
                        } else {
                            HandshakeKind::DataAck
                        };
                        self.handle_mrtap(kind, &message).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed data envelope");
                    }
                }
            }
            MessageType::Error => {
                let message = serde_json::from_slice::<ErrorPayload>(&msg.payload)
                    .map(|p| p.message)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&msg.payload).into_owned());
                self.teardown(Some(message)).await;
            }
            MessageType::CloseDataChannel => {
                self.teardown(None).await;
            }
            other => {
                tracing::debug!(message_type = %other, "ignoring frame on datachannel");
            }
        }
    }

    async fn close(&self, reason: &str) {
        self.teardown(Some(reason.to_string())).await;
    }
}
