//! The hub: shared, cluster-node-local registry of connected clients and
//! their channel subscriptions.
//!
//! State lives behind a single `RwLock`, not a message-passing actor —
//! matching how `GatewayState` guards its maps. A channel-actor would add a
//! hop and a queue for no real benefit here: lookups and membership changes
//! are cheap, and readers vastly outnumber writers during fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mycelium_auth::CapabilityMap;
use mycelium_protocol::OutboundFrame;
use mycelium_store::counters::{current_clients_key, peak_clients_key, subscribers_key};
use mycelium_store::CounterStore;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// A connected, authenticated client.
pub struct Client {
    pub session_id: String,
    pub app_id: String,
    pub api_key_id: String,
    pub capabilities: CapabilityMap,
    sender: mpsc::UnboundedSender<String>,
    channels: HashSet<String>,
}

impl Client {
    #[must_use]
    pub fn new(
        session_id: String,
        app_id: String,
        api_key_id: String,
        capabilities: CapabilityMap,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            session_id,
            app_id,
            api_key_id,
            capabilities,
            sender,
            channels: HashSet::new(),
        }
    }

    /// Send a serialized outbound frame to this client's write loop.
    pub fn send(&self, frame: &OutboundFrame) {
        let _ = self.sender.send(frame.to_json());
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, qualified_channel: &str) -> bool {
        self.channels.contains(qualified_channel)
    }
}

struct Inner {
    clients: HashMap<String, Client>,
    channel_clients: HashMap<String, Vec<String>>,
}

/// Node-local registry of clients and channel subscriptions, backed by
/// cluster-wide best-effort counters.
pub struct Hub {
    inner: RwLock<Inner>,
    counters: Arc<dyn CounterStore>,
}

impl Hub {
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                channel_clients: HashMap::new(),
            }),
            counters,
        }
    }

    /// Register a new client and bump its tenant's `current-clients` counter.
    /// The counter increment is the "tracking" step a caller must see succeed
    /// before accepting any frames from the connection; a failure here is
    /// fatal for the connection (close 4500), unlike steady-state counter
    /// failures elsewhere in the hub, which are best-effort.
    pub async fn register(&self, client: Client) -> anyhow::Result<()> {
        let app_id = client.app_id.clone();
        self.inner
            .write()
            .await
            .clients
            .insert(client.session_id.clone(), client);

        let count = self.counters.incr(&current_clients_key(&app_id)).await?;
        if let Err(e) = self.counters.set_if_greater(&peak_clients_key(&app_id), count).await {
            warn!(app_id, error = %e, "failed to update peak-clients counter");
        }
        Ok(())
    }

    /// Remove a client and reconcile every channel it was still subscribed
    /// to. Safe to call more than once for the same session id.
    pub async fn remove(&self, session_id: &str) -> Option<Client> {
        let mut inner = self.inner.write().await;
        let client = inner.clients.remove(session_id)?;

        for channel in &client.channels {
            if let Some(members) = inner.channel_clients.get_mut(channel) {
                members.retain(|s| s != session_id);
            }
        }
        drop(inner);

        for channel in &client.channels {
            self.decrement_subscriber_count_if_present(channel).await;
        }

        let key = current_clients_key(&client.app_id);
        match self.counters.decr(&key).await {
            Ok(remaining) if remaining <= 0 => {
                let _ = self.counters.delete(&key).await;
            },
            Ok(_) => {},
            Err(e) => warn!(app_id = %client.app_id, error = %e, "failed to decrement current-clients counter"),
        }

        Some(client)
    }

    /// Subscribe `session_id` to `qualified_channel`. Returns `false` if the
    /// client was already subscribed (no counter change, caller should
    /// report "already subscribed").
    pub async fn subscribe(&self, session_id: &str, qualified_channel: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(client) = inner.clients.get_mut(session_id) else {
            return false;
        };
        if !client.channels.insert(qualified_channel.to_string()) {
            return false;
        }
        inner
            .channel_clients
            .entry(qualified_channel.to_string())
            .or_default()
            .push(session_id.to_string());
        drop(inner);

        if let Err(e) = self.counters.incr(&subscribers_key_from(qualified_channel)).await {
            warn!(qualified_channel, error = %e, "failed to increment subscribers counter");
        }
        true
    }

    /// Unsubscribe `session_id` from `qualified_channel`. Returns `false` if
    /// the client wasn't subscribed.
    pub async fn unsubscribe(&self, session_id: &str, qualified_channel: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(client) = inner.clients.get_mut(session_id) else {
            return false;
        };
        if !client.channels.remove(qualified_channel) {
            return false;
        }
        if let Some(members) = inner.channel_clients.get_mut(qualified_channel) {
            members.retain(|s| s != session_id);
        }
        drop(inner);

        let key = subscribers_key_from(qualified_channel);
        match self.counters.decr(&key).await {
            Ok(remaining) if remaining <= 0 => {
                let _ = self.counters.delete(&key).await;
            },
            Ok(_) => {},
            Err(e) => warn!(qualified_channel, error = %e, "failed to decrement subscribers counter"),
        }
        true
    }

    #[must_use]
    pub async fn is_subscribed(&self, session_id: &str, qualified_channel: &str) -> bool {
        self.inner
            .read()
            .await
            .clients
            .get(session_id)
            .is_some_and(|c| c.is_subscribed(qualified_channel))
    }

    #[must_use]
    pub async fn capabilities_of(&self, session_id: &str) -> Option<CapabilityMap> {
        self.inner
            .read()
            .await
            .clients
            .get(session_id)
            .map(|c| c.capabilities.clone())
    }

    #[must_use]
    pub async fn channel_count_of(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .await
            .clients
            .get(session_id)
            .map_or(0, Client::channel_count)
    }

    /// Deliver a publish event to every local subscriber of `qualified_channel`,
    /// except `exclude_session` when it is `Some`.
    pub async fn deliver_local(
        &self,
        qualified_channel: &str,
        channel_name: &str,
        event: &str,
        data: serde_json::Value,
        exclude_session: Option<&str>,
    ) {
        let inner = self.inner.read().await;
        let Some(members) = inner.channel_clients.get(qualified_channel) else {
            return;
        };
        let frame = OutboundFrame::Publish {
            c: channel_name.to_string(),
            e: event.to_string(),
            d: data,
        };
        for session_id in members {
            if exclude_session == Some(session_id.as_str()) {
                continue;
            }
            if let Some(client) = inner.clients.get(session_id) {
                client.send(&frame);
            }
        }
    }

    pub async fn note_published_message(&self, app_id: &str) {
        let key = mycelium_store::counters::published_messages_key(app_id);
        if let Err(e) = self.counters.incr(&key).await {
            warn!(app_id, error = %e, "failed to increment published-messages counter");
        }
    }

    async fn decrement_subscriber_count_if_present(&self, qualified_channel: &str) {
        let key = subscribers_key_from(qualified_channel);
        match self.counters.exists(&key).await {
            Ok(true) => match self.counters.decr(&key).await {
                Ok(remaining) if remaining <= 0 => {
                    let _ = self.counters.delete(&key).await;
                },
                Ok(_) => {},
                Err(e) => warn!(qualified_channel, error = %e, "failed to decrement subscribers counter"),
            },
            Ok(false) => {},
            Err(e) => warn!(qualified_channel, error = %e, "failed to check subscribers counter"),
        }
    }

    #[must_use]
    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

fn subscribers_key_from(qualified_channel: &str) -> String {
    match mycelium_protocol::split_qualified_channel(qualified_channel) {
        Some((app_id, channel)) => subscribers_key(app_id, channel),
        None => subscribers_key(qualified_channel, ""),
    }
}
