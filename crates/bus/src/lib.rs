//! Inter-node bus: publish-subscribe fan-out between gateway nodes over NATS,
//! so a message published on one node reaches subscribers connected to any
//! other node.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// Publish/subscribe against a single fixed subject space. Implemented
/// outside the gateway crate so the hub never depends on a concrete bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()>;

    async fn subscribe(
        &self,
        subject: &str,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = Bytes> + Send>>>;
}

/// `async-nats`-backed bus.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(addr).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> anyhow::Result<std::pin::Pin<Box<dyn Stream<Item = Bytes> + Send>>> {
        use futures::StreamExt;

        let subscriber = self.client.subscribe(subject.to_string()).await?;
        let stream = subscriber.map(|message| message.payload);
        Ok(Box::pin(stream))
    }
}
