//! Broadcast channel port: unordered, at-most-once, fire-and-forget fan-out
//! between connected clients, scoped to a named channel.

use async_trait::async_trait;
use contracts::SyncMessage;
use tokio::sync::broadcast;

use crate::ChannelError;

const LOCAL_BUS_CAPACITY: usize = 256;

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Publishes to every other connected client. No ordering, no delivery
    /// guarantee, no acknowledgment.
    async fn publish(&self, message: SyncMessage) -> Result<(), ChannelError>;

    /// New receiver over the channel's message stream. The transport does not
    /// filter self-echoes; subscribers drop messages bearing their own origin.
    fn subscribe(&self) -> broadcast::Receiver<SyncMessage>;
}

/// In-process bus backed by `tokio::sync::broadcast`, for tests and the demo
/// harness. Every coordinator sharing one bus sees every publish, including
/// its own echoes.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<SyncMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastChannel for LocalBus {
    async fn publish(&self, message: SyncMessage) -> Result<(), ChannelError> {
        // A send with no receivers is not a failure for a fire-and-forget bus.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{SyncPayload, SCHEMA_VERSION_V1};

    fn request_from(origin: &str) -> SyncMessage {
        SyncMessage {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            channel: "watch-sync".to_string(),
            origin_client_id: origin.to_string(),
            origin_privileged: false,
            payload: SyncPayload::RequestAggregate,
        }
    }

    #[tokio::test]
    async fn local_bus_fans_out_to_all_subscribers() {
        let bus = LocalBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(request_from("client_a"))
            .await
            .expect("publish works");

        assert_eq!(
            rx_a.recv().await.expect("a receives").origin_client_id,
            "client_a"
        );
        assert_eq!(
            rx_b.recv().await.expect("b receives").origin_client_id,
            "client_a"
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        bus.publish(request_from("client_a"))
            .await
            .expect("fire-and-forget");
    }
}
