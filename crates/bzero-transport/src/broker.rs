//! Connection broker: the channel-id → subscriber directory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bzero_types::AgentMessage;
use tokio::sync::RwLock;

use crate::{TransportError, TransportResult};

/// Something that consumes frames for one channel. Datachannels implement
/// this; the transport only ever sees the trait.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn receive(&self, msg: AgentMessage);
    async fn close(&self, reason: &str);
}

/// Concurrency-safe directory of live channels.
#[derive(Default)]
pub struct Broker {
    subscribers: RwLock<HashMap<String, Arc<dyn Subscriber>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel_id: &str, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .await
            .insert(channel_id.to_string(), subscriber);
    }

    pub async fn unsubscribe(&self, channel_id: &str) {
        self.subscribers.write().await.remove(channel_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver to one channel; absence is an error the caller decides how
    /// to treat (the transport logs it and moves on, to tolerate races at
    /// open/close).
    pub async fn direct_message(&self, channel_id: &str, msg: AgentMessage) -> TransportResult<()> {
        let subscriber = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(channel_id).cloned()
        };
        match subscriber {
            Some(subscriber) => {
                subscriber.receive(msg).await;
                Ok(())
            }
            None => Err(TransportError::UnknownChannel(channel_id.to_string())),
        }
    }

    /// Deliver to every channel.
    pub async fn broadcast(&self, msg: AgentMessage) {
        let subscribers: Vec<Arc<dyn Subscriber>> =
            self.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            subscriber.receive(msg.clone()).await;
        }
    }

    /// Close one channel and remove it.
    pub async fn close_channel(&self, channel_id: &str, reason: &str) {
        let subscriber = self.subscribers.write().await.remove(channel_id);
        if let Some(subscriber) = subscriber {
            subscriber.close(reason).await;
        }
    }

    /// Close and remove every channel.
    pub async fn close(&self, reason: &str) {
        let subscribers: Vec<Arc<dyn Subscriber>> =
            self.subscribers.write().await.drain().map(|(_, s)| s).collect();
        for subscriber in subscribers {
            subscriber.close(reason).await;
        }
    }
}
