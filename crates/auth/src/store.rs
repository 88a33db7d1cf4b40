use async_trait::async_trait;

/// A tenant api-key row as stored by the persistent tenant/api-key store.
///
/// `capabilities` is the raw JSON-text blob (`pattern -> csv` map encoded as
/// a JSON object string); callers parse it with [`crate::capability::CapabilityMap`].
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub secret: String,
    pub capabilities: String,
    pub app_id: String,
}

/// Persistent lookup of [`ApiKeyRecord`]s by primary key. Implemented outside
/// this crate (SQLite-backed in `mycelium-store`) so the auth resolver never
/// depends on a concrete storage engine.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ApiKeyRecord>>;
}
