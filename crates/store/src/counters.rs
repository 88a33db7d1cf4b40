//! Cluster-wide, best-effort shared counters in a KV store.
//!
//! Every operation is a single atomic KV command (INCR/DECR/SET/DEL/GET);
//! nothing here coordinates multiple keys atomically, mirroring the
//! original's bare `rdb.Incr`/`rdb.Decr` calls against Redis.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use fred::prelude::{Client, KeysInterface};

#[must_use]
pub fn subscribers_key(app_id: &str, channel: &str) -> String {
    format!("subscribers:{app_id}:{channel}")
}

#[must_use]
pub fn current_clients_key(app_id: &str) -> String {
    format!("current-clients:{app_id}")
}

#[must_use]
pub fn peak_clients_key(app_id: &str) -> String {
    format!("peak-clients:{app_id}:{}", month_year())
}

#[must_use]
pub fn published_messages_key(app_id: &str) -> String {
    format!("published-messages:{app_id}:{}", month_year())
}

fn month_year() -> String {
    let now = Utc::now();
    format!("{}-{}", now.month(), now.year())
}

/// Cluster-wide shared counter operations. Each call is one KV command.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr(&self, key: &str) -> anyhow::Result<i64>;
    async fn decr(&self, key: &str) -> anyhow::Result<i64>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Set `key` to `value` only if `key` is absent or currently smaller.
    async fn set_if_greater(&self, key: &str, value: i64) -> anyhow::Result<()>;
}

/// `fred`-backed implementation against a Redis-protocol server.
pub struct RedisCounterStore {
    client: Client,
}

impl RedisCounterStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> anyhow::Result<i64> {
        Ok(self.client.incr(key).await?)
    }

    async fn decr(&self, key: &str) -> anyhow::Result<i64> {
        Ok(self.client.decr(key).await?)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.client.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _: i64 = self.client.del(key).await?;
        Ok(())
    }

    async fn set_if_greater(&self, key: &str, value: i64) -> anyhow::Result<()> {
        let current: Option<i64> = self.client.get(key).await?;
        if current.is_none_or(|c| c < value) {
            let _: () = self.client.set(key, value, None, None, false).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_fixed_naming_scheme() {
        assert_eq!(subscribers_key("app1", "room"), "subscribers:app1:room");
        assert_eq!(current_clients_key("app1"), "current-clients:app1");
        assert!(peak_clients_key("app1").starts_with("peak-clients:app1:"));
        assert!(published_messages_key("app1").starts_with("published-messages:app1:"));
    }
}
