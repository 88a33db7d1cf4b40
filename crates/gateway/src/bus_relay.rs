//! Bus relay: subscribes to the inter-node publish subject and fans each
//! message out to this node's local subscribers.
//!
//! Every publish, including ones this node itself originated, comes back
//! through the bus — the connection actor never delivers locally. This
//! keeps delivery a single code path regardless of which node a publisher
//! is connected to, mirroring the original's NATS-subscription-only fan-out.

use std::sync::Arc;

use futures::StreamExt;
use mycelium_bus::Bus;
use mycelium_protocol::{split_qualified_channel, BusPublish, BUS_SUBJECT};
use tracing::warn;

use crate::hub::Hub;

pub async fn run(bus: Arc<dyn Bus>, hub: Arc<Hub>) -> anyhow::Result<()> {
    let mut stream = bus.subscribe(BUS_SUBJECT).await?;
    while let Some(payload) = stream.next().await {
        let publish: BusPublish = match serde_json::from_slice(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping malformed bus payload");
                continue;
            },
        };

        let Some((_, channel_name)) = split_qualified_channel(&publish.c) else {
            warn!(channel = %publish.c, "dropping publish for malformed qualified channel");
            continue;
        };

        let exclude = if publish.pid.is_empty() {
            None
        } else {
            Some(publish.pid.as_str())
        };

        hub.deliver_local(&publish.c, channel_name, &publish.e, publish.d, exclude)
            .await;
    }
    Ok(())
}
